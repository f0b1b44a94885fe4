use crate::fs::path_context::{PathContext, TRANSFER_TYPES};
use crate::fs::Engine;
use crate::globus::{GlobusClient, GlobusTransferItem};
use crate::model::REQUEST_FILE_STATE_UPLOADING;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callback persisting the monitor's high-water mark so a restarted daemon
/// resumes where it left off.
pub type SaveLastProcessed = Box<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// Daemon-wide task that retires transfer-request-file rows once Globus
/// reports the corresponding upload task as SUCCEEDED. The affected
/// project's filesystem is locked while rows are removed so late writes
/// cannot race the cleanup.
pub struct GlobusTaskMonitor {
    client: Arc<GlobusClient>,
    engine: Arc<Engine>,
    endpoint_id: String,
    settling_period: Duration,
    last_processed: DateTime<Utc>,
    last_project_processed: HashMap<String, DateTime<Utc>>,
    save_last_processed: SaveLastProcessed,
}

impl GlobusTaskMonitor {
    pub fn new(
        client: Arc<GlobusClient>,
        engine: Arc<Engine>,
        endpoint_id: String,
        settling_period: Duration,
        last_processed: Option<DateTime<Utc>>,
        save_last_processed: SaveLastProcessed,
    ) -> GlobusTaskMonitor {
        GlobusTaskMonitor {
            client,
            engine,
            endpoint_id,
            settling_period,
            // Far in the past so the first poll matches everything.
            last_processed: last_processed.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            last_project_processed: HashMap::new(),
            save_last_processed,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!("Starting globus task monitor...");
        loop {
            self.retrieve_and_process_uploads(&token).await;

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Shutting down globus task monitor");
                    return;
                }
                _ = tokio::time::sleep(self.settling_period) => {}
            }
        }
    }

    async fn retrieve_and_process_uploads(&mut self, token: &CancellationToken) {
        let filters = [
            ("filter_status", "SUCCEEDED".to_string()),
            (
                "filter_completion_time",
                self.last_processed.format("%Y-%m-%d").to_string(),
            ),
            ("orderby", "completion_time ASC".to_string()),
            ("limit", "1000".to_string()),
        ];

        let tasks = match self
            .client
            .get_endpoint_task_list(&self.endpoint_id, &filters)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::info!("Globus task list failed: {}", e);
                return;
            }
        };

        for task in tasks.tasks {
            let completed = match DateTime::parse_from_rfc3339(&task.completion_time) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    tracing::error!(
                        "Error parsing task time '{}': {}",
                        task.completion_time,
                        e
                    );
                    continue;
                }
            };

            if self.last_processed > completed {
                // Already seen this task on an earlier poll.
                continue;
            }

            let transfers = match self.client.get_task_successful_transfers(&task.task_id).await
            {
                Ok(transfers) => transfers,
                Err(e) => {
                    tracing::info!(
                        "Successful transfers for task {} failed: {}",
                        task.task_id,
                        e
                    );
                    continue;
                }
            };

            if !transfers.transfers.is_empty() {
                self.process_transfers(completed, &transfers.transfers).await;
            }

            self.last_processed = completed;
            (self.save_last_processed)(self.last_processed);

            if token.is_cancelled() {
                return;
            }
        }
    }

    async fn process_transfers(
        &mut self,
        completed: DateTime<Utc>,
        items: &[GlobusTransferItem],
    ) {
        // A task with a blank destination path is a download, not an upload.
        let Some(first_dest) = items
            .first()
            .and_then(|i| i.destination_path.clone())
            .filter(|p| !p.is_empty())
        else {
            return;
        };

        let Some((ctx, _)) = parse_transfer_destination(&first_dest) else {
            tracing::info!("Invalid globus destination path: {}", first_dest);
            return;
        };

        let key = ctx.project_key();
        if let Some(last) = self.last_project_processed.get(&key) {
            if completed < *last {
                // This (user, project) was already processed past this task.
                return;
            }
        }

        // Quiesce the project while its rows are retired: writes return EIO
        // until the lock drops.
        self.engine.locks.lock(&key);

        for item in items {
            if let Some(dest) = item.destination_path.as_deref().filter(|p| !p.is_empty()) {
                self.process_file_transfer(completed, dest).await;
            }
        }

        self.engine.locks.unlock(&key);
        self.last_project_processed.insert(key, completed);
    }

    async fn process_file_transfer(&self, completed: DateTime<Utc>, dest: &str) {
        let Some((ctx, vpath)) = parse_transfer_destination(dest) else {
            return;
        };

        let request_file = match self
            .engine
            .transfer_store
            .get_transfer_request_file_by_path(ctx.user_id, ctx.project_id, ctx.fs_path())
            .await
        {
            Ok(Some(trf)) => trf,
            Ok(None) => {
                tracing::error!(
                    "No transfer request file for user {}, project {}, path {}",
                    ctx.user_id,
                    ctx.project_id,
                    ctx.fs_path()
                );
                return;
            }
            Err(e) => {
                tracing::error!("Lookup of transfer request file {} failed: {}", dest, e);
                return;
            }
        };

        if request_file.updated_at > completed {
            // A later write raced ahead of this task; leave the row alone.
            return;
        }

        if request_file.state == REQUEST_FILE_STATE_UPLOADING {
            return;
        }

        match self
            .engine
            .transfer_store
            .delete_transfer_request_file(&request_file)
            .await
        {
            Ok(()) => self.engine.tracker.delete(&vpath),
            Err(e) => {
                tracing::error!(
                    "Unable to delete transfer request file for {}: {}",
                    dest,
                    e
                );
            }
        }
    }
}

/// Completed-upload destination paths look like
/// `/__transfers/{type}/{user}/{project}/rest-of-path`. Returns the decoded
/// context and the bridge-side virtual path, or None for paths that do not
/// belong to a bridge transfer.
pub(crate) fn parse_transfer_destination(dest: &str) -> Option<(PathContext, String)> {
    let rest = dest.strip_prefix("/__transfers/")?;
    let vpath = format!("/{}", rest);
    let ctx = PathContext::parse(&vpath);

    if !TRANSFER_TYPES.contains(&ctx.transfer_type.as_str()) {
        return None;
    }
    if ctx.user_id == 0 || ctx.project_id == 0 {
        return None;
    }

    Some((ctx, vpath))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::path::PathBuf;

    fn test_monitor() -> GlobusTaskMonitor {
        let settings = Settings {
            mcfs_dir: PathBuf::from("/tmp/casbridge-test-mcfs"),
            // Nothing listens on port 1; queries fail fast and are logged,
            // which is all the watermark logic needs.
            dsn: "mysql://mc:mc@127.0.0.1:1/mc".to_string(),
            globus_endpoint_id: "endpoint".to_string(),
            globus_cc_user: "user".to_string(),
            globus_cc_token: "token".to_string(),
            api_url: "http://127.0.0.1:1/api".to_string(),
            tx_retry: 3,
            settling_period: Duration::from_secs(10),
            daemon_addr: "127.0.0.1:1323".to_string(),
        };

        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy(&settings.dsn)
            .unwrap();
        let globus = Arc::new(GlobusClient::new(
            &settings.globus_cc_user,
            &settings.globus_cc_token,
        ));
        let engine = Arc::new(Engine::new(&settings, pool, globus.clone()));

        GlobusTaskMonitor::new(
            globus,
            engine,
            settings.globus_endpoint_id.clone(),
            settings.settling_period,
            None,
            Box::new(|_| {}),
        )
    }

    fn upload_item(dest: &str) -> GlobusTransferItem {
        GlobusTransferItem {
            source_path: Some("/source/a.txt".to_string()),
            destination_path: Some(dest.to_string()),
        }
    }

    #[tokio::test]
    async fn test_watermark_tracks_task_completion_time() {
        let mut monitor = test_monitor();
        let key = "/globus/1/7".to_string();
        let items = vec![upload_item("/__transfers/globus/1/7/a.txt")];

        let first = Utc::now() - chrono::Duration::minutes(10);
        let second = first + chrono::Duration::minutes(5);

        monitor.process_transfers(first, &items).await;
        assert_eq!(monitor.last_project_processed.get(&key), Some(&first));

        // A later task for the same project must not be skipped by the
        // watermark the first one left behind.
        monitor.process_transfers(second, &items).await;
        assert_eq!(monitor.last_project_processed.get(&key), Some(&second));
    }

    #[tokio::test]
    async fn test_older_task_is_skipped_and_lock_released() {
        let mut monitor = test_monitor();
        let key = "/globus/1/7".to_string();
        let items = vec![upload_item("/__transfers/globus/1/7/a.txt")];

        let newer = Utc::now() - chrono::Duration::minutes(5);
        let older = newer - chrono::Duration::minutes(5);

        monitor.process_transfers(newer, &items).await;
        monitor.process_transfers(older, &items).await;
        assert_eq!(monitor.last_project_processed.get(&key), Some(&newer));

        // The project lock is only held while rows are being retired.
        assert!(!monitor.engine.locks.is_locked(&key));
    }

    #[test]
    fn test_parse_valid_destination() {
        let (ctx, vpath) =
            parse_transfer_destination("/__transfers/globus/1/7/data/a.txt").unwrap();
        assert_eq!(ctx.transfer_type, "globus");
        assert_eq!(ctx.user_id, 1);
        assert_eq!(ctx.project_id, 7);
        assert_eq!(ctx.fs_path(), "/data/a.txt");
        assert_eq!(vpath, "/globus/1/7/data/a.txt");
    }

    #[test]
    fn test_rejects_paths_outside_transfers() {
        assert!(parse_transfer_destination("/uploads/globus/1/7/a.txt").is_none());
        assert!(parse_transfer_destination("/__transfers/ftp/1/7/a.txt").is_none());
        assert!(parse_transfer_destination("/__transfers/globus/x/y/a.txt").is_none());
        assert!(parse_transfer_destination("/__transfers/globus/1").is_none());
    }
}
