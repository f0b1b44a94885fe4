use crate::error::{BridgeError, Result};
use crate::fs::path_context::PathContext;
use crate::globus::GlobusClient;
use crate::model::{GlobusTransfer, TransferRequest};
use crate::store::{ProjectStore, TransferStore, UserStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// ACL handle attached to a Globus-backed transfer.
#[derive(Debug, Clone)]
pub struct GlobusContext {
    pub acl_id: String,
    pub identity_id: String,
}

#[derive(Debug, Default)]
struct EntryState {
    setup_complete: bool,
    request: Option<TransferRequest>,
    globus: Option<GlobusContext>,
}

#[derive(Debug, Default)]
struct Entry {
    state: Mutex<EntryState>,
}

/// Process-wide map from (transfer-type, user, project) to the transfer
/// request serving that triple. Setup runs at most once per entry, under a
/// per-entry mutex: access is verified, the request row persisted, and for
/// Globus transfers an ACL granted before the entry becomes visible as
/// complete. Hydration from the database at startup prevents a restarted
/// daemon from re-granting ACLs.
pub struct ProjectTransferRegistry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    transfer_store: TransferStore,
    project_store: ProjectStore,
    user_store: UserStore,
    globus: Arc<GlobusClient>,
    globus_endpoint_id: String,
}

impl ProjectTransferRegistry {
    pub fn new(
        transfer_store: TransferStore,
        project_store: ProjectStore,
        user_store: UserStore,
        globus: Arc<GlobusClient>,
        globus_endpoint_id: String,
    ) -> ProjectTransferRegistry {
        ProjectTransferRegistry {
            entries: RwLock::new(HashMap::new()),
            transfer_store,
            project_store,
            user_store,
            globus,
            globus_endpoint_id,
        }
    }

    /// Hydrate the registry with every persisted open request and its Globus
    /// sub-record. Entries loaded here are marked setup-complete; their ACLs
    /// were granted by the process that created them.
    pub async fn load_from_database(&self) -> Result<usize> {
        let open_requests = self.transfer_store.list_open_transfer_requests().await?;
        let count = open_requests.len();

        for (request, globus) in open_requests {
            self.insert_loaded(request, globus).await;
        }

        Ok(count)
    }

    async fn insert_loaded(&self, request: TransferRequest, globus: Option<GlobusTransfer>) {
        let ctx = PathContext::parse(&format!(
            "/globus/{}/{}",
            request.owner_id, request.project_id
        ));
        let entry = self.entry_for(&ctx.project_key());

        let mut state = entry.state.lock().await;
        state.request = Some(request);
        state.globus = globus.map(|g| GlobusContext {
            acl_id: g.globus_acl_id,
            identity_id: g.globus_identity_id,
        });
        state.setup_complete = true;
    }

    fn entry_for(&self, key: &str) -> Arc<Entry> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }

        self.entries
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Return the transfer request for an already-set-up entry.
    pub async fn get(&self, ctx: &PathContext) -> Result<TransferRequest> {
        let entry = {
            let entries = self.entries.read();
            entries.get(&ctx.project_key()).cloned()
        };

        let Some(entry) = entry else {
            return Err(BridgeError::NoProjectTransferRequest);
        };

        let state = entry.state.lock().await;
        match (&state.setup_complete, &state.request) {
            (true, Some(request)) => Ok(request.clone()),
            _ => Err(BridgeError::NoProjectTransferRequest),
        }
    }

    /// Load or create the transfer request for a (type, user, project)
    /// triple. First access verifies project membership, requires a
    /// configured Globus identity for Globus transfers, persists the request
    /// and its sub-record, and grants the endpoint ACL.
    pub async fn get_or_create(&self, ctx: &PathContext) -> Result<TransferRequest> {
        let entry = self.entry_for(&ctx.project_key());

        let mut state = entry.state.lock().await;
        if state.setup_complete {
            // Another caller finished setup between our map probe and the
            // lock; nothing left to do.
            return state
                .request
                .clone()
                .ok_or(BridgeError::NoProjectTransferRequest);
        }

        if !self
            .project_store
            .can_access_project(ctx.user_id, ctx.project_id)
            .await?
        {
            return Err(BridgeError::NoAccessToProject);
        }

        if ctx.is_globus_transfer_type() {
            let user = self
                .user_store
                .get_user(ctx.user_id)
                .await?
                .ok_or(BridgeError::NoAccessToProject)?;

            let Some(globus_user) = user.globus_user.filter(|u| !u.is_empty()) else {
                return Err(BridgeError::NoGlobusAccount);
            };

            let request = self
                .transfer_store
                .create_transfer_request(ctx.project_id, ctx.user_id)
                .await?;

            let identity_id = self.globus.get_identity_id(&globus_user).await?;
            let acl_path = format!("/__transfers{}/", ctx.project_key());
            let acl_id = self
                .globus
                .add_endpoint_acl_rule(&self.globus_endpoint_id, &acl_path, &identity_id, "rw")
                .await?;

            self.transfer_store
                .create_globus_transfer(&request, &acl_id, &identity_id)
                .await?;

            state.globus = Some(GlobusContext {
                acl_id,
                identity_id,
            });
            state.request = Some(request.clone());
            state.setup_complete = true;

            tracing::info!(
                "Opened transfer request {} for {}",
                request.id,
                ctx.project_key()
            );
            return Ok(request);
        }

        // Non-Globus transfer types need no external grant.
        let request = self
            .transfer_store
            .create_transfer_request(ctx.project_id, ctx.user_id)
            .await?;
        state.request = Some(request.clone());
        state.setup_complete = true;
        Ok(request)
    }

    /// Tear down a transfer: revoke the ACL, delete the request row, drop
    /// the entry. ACL and row failures are logged, removal proceeds anyway.
    pub async fn cleanup(&self, ctx: &PathContext) {
        let entry = {
            let entries = self.entries.read();
            entries.get(&ctx.project_key()).cloned()
        };

        let Some(entry) = entry else {
            return;
        };

        let state = entry.state.lock().await;

        if ctx.is_globus_transfer_type() {
            if let Some(globus) = &state.globus {
                if let Err(e) = self
                    .globus
                    .delete_endpoint_acl_rule(&self.globus_endpoint_id, &globus.acl_id)
                    .await
                {
                    tracing::error!(
                        "Failed deleting ACL for {}: {}",
                        ctx.project_key(),
                        e
                    );
                }
            }
        }

        if let Some(request) = &state.request {
            if let Err(e) = self.transfer_store.delete_transfer_request(request).await {
                tracing::error!("Failed to delete TransferRequest {}: {}", request.id, e);
            }
        }

        drop(state);
        self.entries.write().remove(&ctx.project_key());
    }
}

impl std::fmt::Debug for ProjectTransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectTransferRegistry")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}
