use crate::error::{BridgeError, Result};
use std::future::Future;

/// Minimum number of attempts for any transactional write. Two transfers
/// racing on a shared foreign-key row can deadlock; the database aborts one
/// side and a retry is expected to succeed.
pub const MIN_TX_RETRIES: usize = 3;

/// Run a transactional operation up to `max(retry_count, 3)` times,
/// returning the first success or the last error. The closure must build a
/// fresh transaction per call.
pub async fn with_tx_retry<T, F, Fut>(retry_count: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = retry_count.max(MIN_TX_RETRIES);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::debug!("Transaction attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| BridgeError::Config("transaction retry attempted zero times".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = with_tx_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BridgeError>(7) }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retries_transient_failures() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let calls = AtomicUsize::new(0);
            let result = with_tx_retry(3, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BridgeError::Config("deadlock".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

            assert_eq!(result, 42);
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[tokio::test]
    async fn test_floor_of_three_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_tx_retry(0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BridgeError::Config("always fails".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MIN_TX_RETRIES);
    }
}
