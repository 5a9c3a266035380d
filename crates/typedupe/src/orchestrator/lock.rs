//! Raw table insert locks.
//!
//! Each stream owns a read/write lock. Producers appending to the raw table
//! hold the shared side through a [`RawTableInsertLock`]; a typing pass holds
//! the exclusive side while it ranks and consumes raw rows, so it never sees a
//! row set that is still being appended to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{Result, TypeDedupeError};

/// Locks shared between the producer side and the typing passes of a stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamLocks {
    /// Shared: raw inserts. Exclusive: a typing pass.
    insert: Arc<RwLock<()>>,
    /// At most one typing pass per stream.
    typing: Arc<Mutex<()>>,
}

impl StreamLocks {
    pub(crate) fn insert_lock(&self, stream: impl Into<String>) -> RawTableInsertLock {
        RawTableInsertLock {
            stream: stream.into(),
            lock: Some(self.insert.clone()),
        }
    }

    pub(crate) async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.insert.clone().write_owned().await
    }

    /// Wait for the typing slot, or give up immediately unless `must_run`.
    pub(crate) async fn typing_slot(&self, must_run: bool) -> Option<OwnedMutexGuard<()>> {
        if must_run {
            Some(self.typing.clone().lock_owned().await)
        } else {
            self.typing.clone().try_lock_owned().ok()
        }
    }
}

/// Advisory lock a producer takes before appending to a raw table.
///
/// Acquisition is never unbounded unless the caller asks for it: use
/// [`try_lock`](Self::try_lock) or [`lock_timeout`](Self::lock_timeout) when
/// waiting is not acceptable.
#[derive(Debug, Clone)]
pub struct RawTableInsertLock {
    stream: String,
    lock: Option<Arc<RwLock<()>>>,
}

/// Held while appending to a raw table; released on drop.
#[derive(Debug)]
pub struct RawTableInsertGuard {
    _guard: Option<OwnedRwLockReadGuard<()>>,
}

impl RawTableInsertLock {
    /// A lock that always succeeds immediately.
    pub fn noop(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            lock: None,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wait until no typing pass holds the stream.
    pub async fn lock(&self) -> RawTableInsertGuard {
        let guard = match &self.lock {
            Some(lock) => Some(lock.clone().read_owned().await),
            None => None,
        };
        RawTableInsertGuard { _guard: guard }
    }

    /// Acquire without waiting; `None` while a typing pass holds the stream.
    pub fn try_lock(&self) -> Option<RawTableInsertGuard> {
        match &self.lock {
            Some(lock) => lock
                .clone()
                .try_read_owned()
                .ok()
                .map(|g| RawTableInsertGuard { _guard: Some(g) }),
            None => Some(RawTableInsertGuard { _guard: None }),
        }
    }

    /// Wait at most `timeout`.
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<RawTableInsertGuard> {
        tokio::time::timeout(timeout, self.lock())
            .await
            .map_err(|_| TypeDedupeError::LockTimeout {
                stream: self.stream.clone(),
                waited: timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inserts_share_the_lock() {
        let locks = StreamLocks::default();
        let lock = locks.insert_lock("public.users");
        let _a = lock.lock().await;
        let _b = lock.try_lock().expect("shared side is reentrant across holders");
    }

    #[tokio::test]
    async fn test_typing_pass_blocks_inserts() {
        let locks = StreamLocks::default();
        let lock = locks.insert_lock("public.users");

        let exclusive = locks.exclusive().await;
        assert!(lock.try_lock().is_none());

        let err = lock
            .lock_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TypeDedupeError::LockTimeout { ref stream, .. } if stream == "public.users"));
        assert_eq!(err.exit_code(), 6);

        drop(exclusive);
        assert!(lock.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_noop_lock_always_succeeds() {
        let lock = RawTableInsertLock::noop("public.users");
        assert!(lock.try_lock().is_some());
        lock.lock_timeout(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_typing_slot_try_semantics() {
        let locks = StreamLocks::default();
        let held = locks.typing_slot(true).await;
        assert!(held.is_some());
        assert!(locks.typing_slot(false).await.is_none());
        drop(held);
        assert!(locks.typing_slot(false).await.is_some());
    }
}
