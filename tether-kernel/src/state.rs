use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Verrous async par clé ("queue:<device>", "device:<device>")
///
/// Sérialise les read-modify-write sur un même chemin du Record Store.
/// Valable pour un seul process kernel : deux kernels sur le même store restent concurrents.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Shared<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.locks.lock();
            map.entry(key.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Nombre de clés connues (les verrous ne sont jamais libérés, un par device)
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("queue:d1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("queue:d1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("queue:d1").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("queue:d2"))
            .await
            .expect("distinct key must not wait");
        assert_eq!(locks.len(), 2);
    }
}
