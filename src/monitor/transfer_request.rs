use crate::store::TransferStore;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Per-mount task that watches the owning transfer request. The request
/// transitioning to closed, or its row disappearing, is the terminal signal
/// that drives unmount: a shutdown message is sent and the monitor exits.
pub struct TransferRequestMonitor {
    transfer_store: TransferStore,
    request_id: i64,
    shutdown: mpsc::Sender<()>,
}

impl TransferRequestMonitor {
    pub fn new(
        transfer_store: TransferStore,
        request_id: i64,
        shutdown: mpsc::Sender<()>,
    ) -> TransferRequestMonitor {
        TransferRequestMonitor {
            transfer_store,
            request_id,
            shutdown,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        loop {
            if self.request_is_closed_or_deleted().await {
                return;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Shutting down transfer request monitor");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn request_is_closed_or_deleted(&self) -> bool {
        match self.transfer_store.get_transfer_request(self.request_id).await {
            Ok(None) => {
                tracing::info!("TransferRequest {} removed from database", self.request_id);
                let _ = self.shutdown.send(()).await;
                true
            }
            Ok(Some(request)) if request.is_closed() => {
                tracing::info!("TransferRequest {} closed", self.request_id);
                let _ = self.shutdown.send(()).await;
                true
            }
            Ok(Some(_)) => false,
            Err(e) => {
                // (Hopefully) transient database error.
                tracing::error!("Error querying transfer request {}: {}", self.request_id, e);
                false
            }
        }
    }
}
