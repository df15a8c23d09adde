//! Distributed lock abstraction backing the Position Coordinator's
//! `(userId, symbol)` serialization (spec.md §5, §4.6 step 1). Spec.md notes
//! the backing store is "external (e.g., Redis)"; this crate ships an
//! in-process, `parking_lot`-backed default that implements the same TTL +
//! heartbeat contract (60 s TTL, 15 s heartbeat) so a future Redis-backed
//! implementation is a drop-in replacement behind the same trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub const LOCK_TTL: Duration = Duration::from_secs(60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire `key` without blocking. Returns `None` if held
    /// by someone else and not yet expired.
    async fn try_acquire(self: Arc<Self>, key: String) -> Option<LockHandle>;
}

/// Held while a lock is checked out; releases on drop. Call `heartbeat()`
/// periodically during long-running critical sections to refresh the TTL.
pub struct LockHandle {
    key: String,
    registry: Arc<dyn LockRegistry>,
}

impl LockHandle {
    pub fn heartbeat(&self) {
        self.registry.refresh(&self.key);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

trait LockRegistry: Send + Sync {
    fn refresh(&self, key: &str);
    fn release(&self, key: &str);
}

pub struct InProcessLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl Default for InProcessLock {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl LockRegistry for InProcessLock {
    fn refresh(&self, key: &str) {
        if let Some(expiry) = self.held.lock().get_mut(key) {
            *expiry = Instant::now() + LOCK_TTL;
        }
    }

    fn release(&self, key: &str) {
        self.held.lock().remove(key);
    }
}

#[async_trait]
impl DistributedLock for InProcessLock {
    async fn try_acquire(self: Arc<Self>, key: String) -> Option<LockHandle> {
        let mut held = self.held.lock();
        let now = Instant::now();
        if let Some(expiry) = held.get(&key) {
            if *expiry > now {
                return None;
            }
        }
        held.insert(key.clone(), now + LOCK_TTL);
        drop(held);
        Some(LockHandle {
            key,
            registry: self,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_on_same_key_fails_until_released() {
        let lock = Arc::new(InProcessLock::new());
        let guard = lock.clone().try_acquire("user-1:BTCUSDT".into()).await;
        assert!(guard.is_some());

        let second = lock.clone().try_acquire("user-1:BTCUSDT".into()).await;
        assert!(second.is_none());

        drop(guard);
        let third = lock.clone().try_acquire("user-1:BTCUSDT".into()).await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let lock = Arc::new(InProcessLock::new());
        let a = lock.clone().try_acquire("user-1:BTCUSDT".into()).await;
        let b = lock.clone().try_acquire("user-1:ETHUSDT".into()).await;
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
