use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// One async mutex per key, created on first use.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard owns its mutex, so no map entry is borrowed while waiting.
    pub async fn lock(&self, key: Ulid) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for a deleted key. A holder of an outstanding guard
    /// keeps its mutex alive until it finishes.
    pub fn forget(&self, key: &Ulid) {
        self.locks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let key = Ulid::new();
        let guard = locks.lock(key).await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(key).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(Ulid::new()).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Ulid::new()))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let locks = KeyedLocks::new();
        let key = Ulid::new();
        drop(locks.lock(key).await);
        locks.forget(&key);
        assert!(locks.is_empty());
    }
}
