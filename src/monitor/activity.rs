use crate::model::TransferRequest;
use crate::store::TransferStore;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(20);
const ONE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Process-wide counter bumped on every read and write. The activity
/// monitor watches it to detect quiescent mounts.
#[derive(Debug, Clone, Default)]
pub struct ActivityCounter {
    count: Arc<AtomicI64>,
}

impl ActivityCounter {
    pub fn new() -> ActivityCounter {
        ActivityCounter::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Stale detection: the counter failing to advance for longer than the idle
/// window means nothing has touched the mount.
#[derive(Debug)]
pub(crate) struct IdleTracker {
    window: Duration,
    last_seen: i64,
    last_changed: Instant,
}

impl IdleTracker {
    pub(crate) fn new(now: Instant, window: Duration) -> IdleTracker {
        IdleTracker {
            window,
            last_seen: 0,
            last_changed: now,
        }
    }

    /// Record an observation of the counter; true once the counter has been
    /// unchanged for at least the idle window.
    pub(crate) fn observe(&mut self, count: i64, now: Instant) -> bool {
        if count != self.last_seen {
            self.last_seen = count;
            self.last_changed = now;
            return false;
        }

        now.duration_since(self.last_changed) >= self.window
    }
}

/// Per-mount task that closes the transfer request after a week without any
/// read or write. Closing is observed by the transfer-request monitor,
/// which performs the actual shutdown.
pub struct ActivityMonitor {
    transfer_store: TransferStore,
    request: TransferRequest,
    counter: ActivityCounter,
    poll_interval: Duration,
    idle_window: Duration,
}

impl ActivityMonitor {
    pub fn new(
        transfer_store: TransferStore,
        request: TransferRequest,
        counter: ActivityCounter,
    ) -> ActivityMonitor {
        ActivityMonitor {
            transfer_store,
            request,
            counter,
            poll_interval: POLL_INTERVAL,
            idle_window: ONE_WEEK,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        tracing::info!("Starting activity monitor...");
        let mut idle = IdleTracker::new(Instant::now(), self.idle_window);

        loop {
            if idle.observe(self.counter.value(), Instant::now()) {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Shutting down activity monitor");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(
            "Transfer request {} inactive for too long, marking closed",
            self.request.id
        );
        if let Err(e) = self
            .transfer_store
            .mark_transfer_request_closed(&self.request)
            .await
        {
            tracing::error!(
                "Failed to close inactive transfer request {}: {}",
                self.request.id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counter = ActivityCounter::new();
        assert_eq!(counter.value(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.value(), 2);

        // Clones observe the same underlying count.
        let clone = counter.clone();
        clone.increment();
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn test_idle_tracker_expires_without_activity() {
        let start = Instant::now();
        let mut idle = IdleTracker::new(start, Duration::from_secs(60));

        assert!(!idle.observe(0, start + Duration::from_secs(30)));
        assert!(idle.observe(0, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_idle_tracker_resets_on_activity() {
        let start = Instant::now();
        let mut idle = IdleTracker::new(start, Duration::from_secs(60));

        assert!(!idle.observe(5, start + Duration::from_secs(59)));
        // Window restarts from the observation that saw the change.
        assert!(!idle.observe(5, start + Duration::from_secs(100)));
        assert!(idle.observe(5, start + Duration::from_secs(119)));
    }
}
