//! Per-repository serialization of reconciliation work
//!
//! Branch checkouts share one working tree, so two operations on the same
//! repository must never interleave. Different repositories never contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Keyed mutex: repository path -> lock
#[derive(Clone, Default)]
pub struct RepoLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(Self::key(path))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the repository's lock.
    ///
    /// Blocks until any other operation on the same repository finishes. The
    /// lock is released on every exit path; a panic in a previous holder does
    /// not wedge the repository.
    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of repositories seen so far
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_repo_is_serialized() {
        let locks = RepoLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    locks.with_lock(Path::new("/tmp/knowsync-lock-test"), || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_different_repos_get_different_locks() {
        let locks = RepoLocks::new();
        let nested = locks.with_lock(Path::new("/tmp/knowsync-a"), || {
            // Would deadlock if both paths shared a lock
            locks.with_lock(Path::new("/tmp/knowsync-b"), || 7)
        });
        assert_eq!(nested, 7);
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_lock_survives_panic() {
        let locks = RepoLocks::new();
        let path = Path::new("/tmp/knowsync-panic");
        let cloned = locks.clone();
        let result = thread::spawn(move || {
            cloned.with_lock(Path::new("/tmp/knowsync-panic"), || panic!("boom"));
        })
        .join();

        assert!(result.is_err());
        assert_eq!(locks.with_lock(path, || "free"), "free");
    }
}
