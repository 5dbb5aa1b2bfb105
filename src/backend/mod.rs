//! Thin adapters over the external primitives the core consumes: a message
//! queue, a blob store, and a task-launch API. Everything above this module
//! is backend-agnostic; swapping a cloud queue for the local SQLite one is a
//! trait-impl change.

pub mod blob;
pub mod launch;
pub mod queue;

use std::time::Duration;

use tracing::warn;

use crate::error::Result;

pub use blob::{BlobStore, FsBlobStore};
pub use launch::{LaunchSpec, LaunchStatus, ProcessLauncher, TaskHandle, TaskLauncher};
pub use queue::{JobQueue, QueueLease, SqliteQueue};

const BACKOFF_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

/// Retry a store/queue call on transient failure: up to three attempts with
/// exponential, deterministically jittered delays. Non-transient errors
/// surface immediately.
pub async fn with_backoff<T, F, Fut>(context: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < BACKOFF_ATTEMPTS => {
                let base = BACKOFF_BASE_MS << attempt;
                let jitter = (attempt as u64 * 37 + context.len() as u64 * 13) % 50;
                let delay = Duration::from_millis(base + jitter);
                warn!(
                    context = context,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient backend error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiaryError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_backoff_retries_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32> = with_backoff("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiaryError::TransientBackend("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32> = with_backoff("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiaryError::TransientBackend("down".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32> = with_backoff("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiaryError::PermanentBackend("corrupt".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
