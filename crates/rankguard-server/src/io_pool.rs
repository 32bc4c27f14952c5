//! Bounded pool for storage I/O.
//!
//! Every repository call goes through [`IoPool::run`], which holds one semaphore
//! permit for the duration of the call. Waiting for a permit is bounded so a
//! saturated pool surfaces as a transient failure instead of an unbounded queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rankguard_domain::{DomainError, DomainResult};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct IoPool {
    permits: Arc<Semaphore>,
    workers: usize,
    acquire_timeout: Duration,
}

impl IoPool {
    pub fn new(workers: usize, acquire_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            acquire_timeout,
        }
    }

    /// Maximum concurrent calls.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `call` while holding a permit.
    pub async fn run<T, F>(&self, call: F) -> DomainResult<T>
    where
        F: Future<Output = DomainResult<T>>,
    {
        let _permit = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(DomainError::Internal {
                    message: "storage pool is shut down".to_string(),
                })
            }
            Err(_elapsed) => {
                metrics::counter!("rankguard_io_pool_saturated_total").increment(1);
                return Err(DomainError::TransientIo {
                    message: format!(
                        "no storage worker available within {}ms",
                        self.acquire_timeout.as_millis()
                    ),
                });
            }
        };
        call.await
    }

    /// Rejects every queued and future call.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_workers() {
        // Arrange
        let pool = IoPool::new(2, Duration::from_secs(5));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        // Act
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.run(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Assert
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_fails_transiently() {
        let pool = IoPool::new(1, Duration::from_millis(20));
        let blocker = pool.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            blocker
                .run(async {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        while pool.available() > 0 {
            tokio::task::yield_now().await;
        }

        let result = pool.run(async { Ok(()) }).await;

        assert!(matches!(result, Err(DomainError::TransientIo { .. })));
        let _ = release_tx.send(());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_calls() {
        let pool = IoPool::new(1, Duration::from_secs(1));
        pool.close();
        let result = pool.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(DomainError::Internal { .. })));
        assert!(pool.is_closed());
    }
}
