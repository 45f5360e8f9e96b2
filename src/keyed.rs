use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key async mutual exclusion.
///
/// The outer map lock is only held long enough to find or create the slot for
/// a key; callers then wait on that key's own mutex, so work on unrelated keys
/// never contends. The guard may be held across `.await` points.
pub struct KeyedMutex<K, V> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K, V> Default for KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys that have ever been locked.
    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks: Arc<KeyedMutex<String, u32>> = Arc::new(KeyedMutex::new());
        let guard = locks.lock(&"a".to_string()).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let mut g = locks2.lock(&"a".to_string()).await;
            *g += 1;
            *g
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second lock on same key must wait");
        drop(guard);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks: KeyedMutex<String, ()> = KeyedMutex::new();
        let _a = locks.lock(&"a".to_string()).await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock(&"b".to_string())).await;
        assert!(b.is_ok());
        assert_eq!(locks.key_count(), 2);
    }

    #[tokio::test]
    async fn value_persists_between_locks() {
        let locks: KeyedMutex<u8, Option<String>> = KeyedMutex::new();
        *locks.lock(&1).await = Some("cached".into());
        assert_eq!(locks.lock(&1).await.as_deref(), Some("cached"));
        assert!(locks.lock(&2).await.is_none());
    }
}
