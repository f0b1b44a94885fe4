use crate::error::{BridgeError, Result};
use serde::Deserialize;

const AUTH_BASE: &str = "https://auth.globus.org";
const TRANSFER_BASE: &str = "https://transfer.api.globus.org/v0.10";
const TRANSFER_SCOPE: &str = "urn:globus:auth:scope:transfer.api.globus.org:all";

/// Confidential (client-credentials) Globus client. The access token is
/// fetched lazily and cached; Globus tokens are long-lived relative to a
/// bridge's lifetime, so no refresh bookkeeping is kept beyond retrying on
/// the next call after an expiry error.
pub struct GlobusClient {
    http: reqwest::Client,
    cc_user: String,
    cc_token: String,
    token: tokio::sync::Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct IdentitiesResponse {
    identities: Vec<Identity>,
}

#[derive(Debug, Deserialize)]
struct AclResponse {
    access_id: String,
}

/// One task from the endpoint task list. Completion time is RFC3339.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobusTask {
    pub task_id: String,
    pub completion_time: String,
}

#[derive(Debug, Deserialize)]
pub struct GlobusTaskList {
    #[serde(rename = "DATA", default)]
    pub tasks: Vec<GlobusTask>,
}

/// A successfully transferred item. Uploads carry a destination path;
/// downloads leave it empty.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobusTransferItem {
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GlobusTransferItems {
    #[serde(rename = "DATA", default)]
    pub transfers: Vec<GlobusTransferItem>,
}

impl GlobusClient {
    pub fn new(cc_user: &str, cc_token: &str) -> GlobusClient {
        GlobusClient {
            http: reqwest::Client::new(),
            cc_user: cc_user.to_string(),
            cc_token: cc_token.to_string(),
            token: tokio::sync::Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .http
            .post(format!("{}/v2/oauth2/token", AUTH_BASE))
            .basic_auth(&self.cc_user, Some(&self.cc_token))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", TRANSFER_SCOPE),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "token request failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        *cached = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    /// Resolve a Globus username to its identity id.
    pub async fn get_identity_id(&self, username: &str) -> Result<String> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/v2/api/identities", AUTH_BASE))
            .bearer_auth(&token)
            .query(&[("usernames", username)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "identity lookup for {} failed with status {}",
                username,
                response.status()
            )));
        }

        let identities: IdentitiesResponse = response.json().await?;
        identities
            .identities
            .into_iter()
            .next()
            .map(|i| i.id)
            .ok_or_else(|| BridgeError::Globus(format!("no identity found for {}", username)))
    }

    /// Grant `permissions` (e.g. "rw") on `path` to an identity. Returns the
    /// ACL rule id needed to revoke the grant later.
    pub async fn add_endpoint_acl_rule(
        &self,
        endpoint_id: &str,
        path: &str,
        identity_id: &str,
        permissions: &str,
    ) -> Result<String> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "DATA_TYPE": "access",
            "principal_type": "identity",
            "principal": identity_id,
            "path": path,
            "permissions": permissions,
        });

        let response = self
            .http
            .post(format!("{}/endpoint/{}/access", TRANSFER_BASE, endpoint_id))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "acl grant on {} failed with status {}",
                path,
                response.status()
            )));
        }

        let acl: AclResponse = response.json().await?;
        Ok(acl.access_id)
    }

    pub async fn delete_endpoint_acl_rule(&self, endpoint_id: &str, acl_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!(
                "{}/endpoint/{}/access/{}",
                TRANSFER_BASE, endpoint_id, acl_id
            ))
            .bearer_auth(&token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "acl delete {} failed with status {}",
                acl_id,
                response.status()
            )));
        }

        Ok(())
    }

    /// Tasks on the endpoint matching the given filter pairs (status,
    /// completion time, ordering, limit).
    pub async fn get_endpoint_task_list(
        &self,
        endpoint_id: &str,
        filters: &[(&str, String)],
    ) -> Result<GlobusTaskList> {
        let token = self.access_token().await?;
        let mut query: Vec<(&str, String)> =
            vec![("filter_endpoint", endpoint_id.to_string())];
        query.extend(filters.iter().cloned());

        let response = self
            .http
            .get(format!("{}/endpoint_manager/task_list", TRANSFER_BASE))
            .bearer_auth(&token)
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "task list failed with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    pub async fn get_task_successful_transfers(
        &self,
        task_id: &str,
    ) -> Result<GlobusTransferItems> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/endpoint_manager/task/{}/successful_transfers",
                TRANSFER_BASE, task_id
            ))
            .bearer_auth(&token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::Globus(format!(
                "successful transfers for task {} failed with status {}",
                task_id,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for GlobusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobusClient")
            .field("cc_user", &self.cc_user)
            .finish_non_exhaustive()
    }
}
