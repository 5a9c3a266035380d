//! Bounded worker pool for per-stream jobs.
//!
//! The pool is owned by one typer/deduper instance. Jobs are spawned onto the
//! tokio runtime, at most `size` at a time, and [`TypingPool::run_all`] is a
//! join barrier: it waits for every scheduled job before reporting the first
//! failure.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Result, TypeDedupeError};

/// Fixed-size pool of concurrent stream jobs.
#[derive(Debug)]
pub struct TypingPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    cancel: CancellationToken,
}

impl TypingPool {
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shutdown(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Run every job and wait for all of them.
    ///
    /// Cancellation stops scheduling new jobs; jobs already running finish.
    /// Returns the first error in scheduling order.
    pub async fn run_all<F>(&self, jobs: Vec<(String, F)>) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(jobs.len());
        let mut first_error: Option<TypeDedupeError> = None;

        for (name, job) in jobs {
            if self.cancel.is_cancelled() {
                debug!("Cancellation requested, not scheduling {}", name);
                first_error.get_or_insert(TypeDedupeError::Cancelled);
                break;
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    first_error.get_or_insert(TypeDedupeError::Cancelled);
                    break;
                }
            };

            let handle = tokio::spawn(async move {
                let result = job.await;
                drop(permit);
                result
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => debug!("{}: done", name),
                Ok(Err(e)) => {
                    error!("{}: failed - {}", name, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("{}: task panicked - {}", name, e);
                    first_error.get_or_insert(TypeDedupeError::TaskPanicked(format!(
                        "{}: {}",
                        name, e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Refuse new jobs. Idempotent.
    pub fn shutdown(&self) {
        if !self.semaphore.is_closed() {
            debug!("Shutting down typing pool ({} workers)", self.size);
            self.semaphore.close();
        }
    }
}

impl Drop for TypingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = TypingPool::new(2, CancellationToken::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                (format!("job{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), TypeDedupeError>(())
                })
            })
            .collect();

        pool.run_all(jobs).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failure_waits_for_other_jobs() {
        let pool = TypingPool::new(4, CancellationToken::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let mut jobs: Vec<(String, std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>)> =
            Vec::new();
        jobs.push((
            "bad".into(),
            Box::pin(async { Err::<(), _>(TypeDedupeError::destination("boom", "test")) }),
        ));
        for i in 0..3 {
            let finished = finished.clone();
            jobs.push((
                format!("ok{}", i),
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), TypeDedupeError>(())
                }),
            ));
        }

        let err = pool.run_all(jobs).await.unwrap_err();
        assert!(matches!(err, TypeDedupeError::Destination { .. }));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let pool = TypingPool::new(1, CancellationToken::new());
        let explode = true;
        let jobs = vec![("explodes".to_string(), async move {
            if explode {
                panic!("kaboom");
            }
            Ok::<(), TypeDedupeError>(())
        })];
        let err = pool.run_all(jobs).await.unwrap_err();
        assert!(matches!(err, TypeDedupeError::TaskPanicked(ref msg) if msg.starts_with("explodes")));
    }

    #[tokio::test]
    async fn test_cancelled_pool_schedules_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = TypingPool::new(1, cancel);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let jobs = vec![("never".to_string(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TypeDedupeError>(())
        })];
        assert!(matches!(
            pool.run_all(jobs).await,
            Err(TypeDedupeError::Cancelled)
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = TypingPool::new(3, CancellationToken::new());
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shutdown());
        let jobs = vec![("late".to_string(), async { Ok::<(), TypeDedupeError>(()) })];
        assert!(pool.run_all(jobs).await.is_err());
    }
}
