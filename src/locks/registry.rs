//! Non-blocking named lock registry
//!
//! Guards concurrent operations on the same volume or snapshot. A second
//! acquirer is never queued: it gets `false` (or `OperationPending`) straight
//! away and the caller is expected to retry.

use crate::error::{Error, Result};
use dashmap::DashSet;
use std::sync::Arc;
use tracing::error;

// =============================================================================
// Lock Registry
// =============================================================================

/// Process-local set of held keys
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: DashSet<String>,
}

impl LockRegistry {
    /// Create a new registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take `key`; false if someone already holds it
    pub fn try_acquire(&self, key: &str) -> bool {
        self.held.insert(key.to_string())
    }

    /// Drop `key`; releasing a key that is not held is a no-op
    pub fn release(&self, key: &str) {
        self.held.remove(key);
    }

    /// Check if `key` is currently held
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Take `key` for the lifetime of the returned guard
    ///
    /// Contention is reported as `OperationPending`, which callers surface as
    /// a retryable abort.
    pub fn lock(&self, key: &str) -> Result<LockGuard<'_>> {
        if !self.try_acquire(key) {
            error!("An operation with the given ID {} already exists", key);
            return Err(Error::OperationPending {
                key: key.to_string(),
            });
        }

        Ok(LockGuard {
            registry: self,
            key: key.to_string(),
        })
    }
}

// =============================================================================
// Lock Guard
// =============================================================================

/// Releases its key on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_try_acquire_and_release() {
        let registry = LockRegistry::new();

        assert!(registry.try_acquire("pvc-1"));
        assert!(!registry.try_acquire("pvc-1"));
        assert!(registry.try_acquire("pvc-2"));

        registry.release("pvc-1");
        assert!(registry.try_acquire("pvc-1"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let registry = LockRegistry::new();
        registry.release("never-taken");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        const CALLERS: usize = 16;
        let registry = LockRegistry::new();
        let barrier = Arc::new(Barrier::new(CALLERS));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    if registry.try_acquire("pvc-contended") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        registry.release("pvc-contended");
        assert!(registry.try_acquire("pvc-contended"));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = LockRegistry::new();
        {
            let guard = registry.lock("snap-1").unwrap();
            assert_eq!(guard.key(), "snap-1");
            assert_matches!(registry.lock("snap-1"), Err(Error::OperationPending { .. }));
        }
        assert!(!registry.is_held("snap-1"));
        assert!(registry.lock("snap-1").is_ok());
    }

    #[test]
    fn test_guard_held_across_await() {
        let registry = LockRegistry::new();
        tokio_test::block_on(async {
            let guard = tokio_test::assert_ok!(registry.lock("pvc-1"));
            tokio::task::yield_now().await;
            tokio_test::assert_err!(registry.lock("pvc-1"));
            drop(guard);
        });
        assert!(registry.is_empty());
    }
}
