//! Per-path mutual exclusion.
//!
//! At most one check-or-download runs per logical path. Entries are created
//! on demand and evicted once the last holder or waiter is gone, so the map
//! only ever holds paths that are in use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::path::LogicalPath;

#[derive(Debug, Default)]
struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    /// Holder plus waiters.
    users: usize,
}

#[derive(Debug, Default)]
pub struct PathLocks {
    entries: Mutex<HashMap<LogicalPath, Entry>>,
}

/// Held lock on one path; releases and evicts on drop.
///
/// A waiter owns its guard before it starts waiting, so a lock future that
/// is dropped mid-wait still deregisters.
#[derive(Debug)]
pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: LogicalPath,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &LogicalPath) -> PathGuard<'_> {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(path.clone()).or_default();
            entry.users += 1;
            entry.mutex.clone()
        };
        let mut held = PathGuard {
            locks: self,
            path: path.clone(),
            guard: None,
        };
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Number of paths currently locked or waited on.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut entries = self.locks.entries.lock();
        if let Some(entry) = entries.get_mut(&self.path) {
            entry.users -= 1;
            if entry.users == 0 {
                entries.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lp(raw: &str) -> LogicalPath {
        LogicalPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_lock_evicts_on_release() {
        let locks = PathLocks::new();
        {
            let _a = locks.lock(&lp("a")).await;
            let _b = locks.lock(&lp("b")).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_path_is_exclusive() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.lock(&lp("x")).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&lp("x")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        // The waiter keeps the entry alive after we release.
        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_evicted() {
        let locks = PathLocks::new();
        let guard = locks.lock(&lp("x")).await;

        let key = lp("x");
        let mut waiting = Box::pin(locks.lock(&key));
        let timed_out = tokio::time::timeout(Duration::from_millis(10), &mut waiting).await;
        assert!(timed_out.is_err());

        // Holder leaves first, then the waiter gives up without being polled.
        drop(guard);
        assert_eq!(locks.len(), 1);
        drop(waiting);
        assert!(locks.is_empty());
    }
}
