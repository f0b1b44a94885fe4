use crate::store::TransferStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// A bridge process spawned through the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveBridge {
    pub transfer_request_id: i64,
    pub mount_path: String,
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
pub struct StartBridgeRequest {
    pub transfer_request_id: i64,
    pub mount_path: String,
    pub log_path: String,
}

#[derive(Debug, Deserialize)]
pub struct StopBridgeRequest {
    pub transfer_request_id: i64,
}

/// Control-plane state: the live bridge table and the store used to close
/// requests. The table is authoritative only for bridges this daemon
/// spawned; a bridge exiting on its own is reaped out of the table.
pub struct DaemonState {
    transfer_store: TransferStore,
    bridges: Mutex<HashMap<i64, ActiveBridge>>,
}

impl DaemonState {
    pub fn new(transfer_store: TransferStore) -> DaemonState {
        DaemonState {
            transfer_store,
            bridges: Mutex::new(HashMap::new()),
        }
    }
}

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/api/start-bridge", post(start_bridge))
        .route("/api/stop-bridge", post(stop_bridge))
        .route("/api/list-active-bridges", get(list_active_bridges))
        .route("/api/stop-server", get(stop_server))
        .with_state(state)
}

/// Fork a per-request bridge process. The bridge runs `casbridge mount` with
/// its output redirected to the requested log file and is reaped from the
/// active table when it exits.
async fn start_bridge(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<StartBridgeRequest>,
) -> StatusCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!("Cannot determine bridge executable: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let log = match std::fs::File::create(&req.log_path) {
        Ok(log) => log,
        Err(e) => {
            tracing::error!("Cannot create bridge log {}: {}", req.log_path, e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let stderr_log = match log.try_clone() {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Cannot clone bridge log handle: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let mut child = match tokio::process::Command::new(exe)
        .arg("mount")
        .arg(&req.mount_path)
        .arg("--transfer-request-id")
        .arg(req.transfer_request_id.to_string())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(
                "Failed to start bridge for transfer request {}: {}",
                req.transfer_request_id,
                e
            );
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let pid = child.id().unwrap_or(0);
    tracing::info!(
        "Started bridge pid {} for transfer request {} at {}",
        pid,
        req.transfer_request_id,
        req.mount_path
    );

    state.bridges.lock().insert(
        req.transfer_request_id,
        ActiveBridge {
            transfer_request_id: req.transfer_request_id,
            mount_path: req.mount_path,
            pid,
        },
    );

    let reap_state = state.clone();
    let request_id = req.transfer_request_id;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!("Bridge for request {} exited: {}", request_id, status),
            Err(e) => tracing::error!("Waiting on bridge for request {} failed: {}", request_id, e),
        }
        reap_state.bridges.lock().remove(&request_id);
    });

    StatusCode::NO_CONTENT
}

/// Mark the request closed; the bridge's own monitor notices within its
/// poll interval and unmounts.
async fn stop_bridge(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<StopBridgeRequest>,
) -> StatusCode {
    let request = match state
        .transfer_store
        .get_transfer_request(req.transfer_request_id)
        .await
    {
        Ok(Some(request)) => request,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!(
                "Lookup of transfer request {} failed: {}",
                req.transfer_request_id,
                e
            );
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    if let Err(e) = state.transfer_store.mark_transfer_request_closed(&request).await {
        tracing::error!("Failed to close transfer request {}: {}", request.id, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    StatusCode::NO_CONTENT
}

async fn list_active_bridges(State(state): State<Arc<DaemonState>>) -> Json<Vec<ActiveBridge>> {
    let bridges = state.bridges.lock().values().cloned().collect();
    Json(bridges)
}

async fn stop_server() -> StatusCode {
    tracing::info!("Stop requested through control plane, exiting...");
    tokio::spawn(async {
        // Give the response a moment to flush before the process dies.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    StatusCode::NO_CONTENT
}

/// Read the task monitor's persisted high-water mark.
pub fn load_last_processed(path: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(path).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Save callback handed to the task monitor. Failures are logged; the
/// monitor keeps its in-memory mark either way.
pub fn save_last_processed_fn(path: PathBuf) -> Box<dyn Fn(DateTime<Utc>) + Send + Sync> {
    Box::new(move |t: DateTime<Utc>| {
        if let Err(e) = std::fs::write(&path, t.to_rfc3339()) {
            tracing::error!("Failed persisting task monitor state to {:?}: {}", path, e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_processed_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state");

        assert!(load_last_processed(&path).is_none());

        let save = save_last_processed_fn(path.clone());
        let stamp = Utc::now();
        save(stamp);

        let loaded = load_last_processed(&path).unwrap();
        assert_eq!(loaded.timestamp(), stamp.timestamp());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state");
        std::fs::write(&path, "not a timestamp").unwrap();
        assert!(load_last_processed(&path).is_none());
    }
}
