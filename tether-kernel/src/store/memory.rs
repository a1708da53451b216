/**
 * MEMORY STORE - Record Store en mémoire avec snapshot JSON optionnel
 *
 * FONCTIONNEMENT :
 * - Un seul arbre serde_json::Value protégé par un Mutex
 * - Si un chemin de snapshot est configuré, l'arbre complet est réécrit après
 *   chaque mutation et rechargé à l'ouverture
 * - Les clés de push sont "{millis:013}{seq:06}" : uniques et croissantes
 */

use super::{split_path, RecordStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tracing::{debug, info};

pub struct MemoryStore {
    root: Mutex<Value>,
    snapshot_path: Option<PathBuf>,
    /// Ordonne les réécritures du snapshot : la dernière écrite reflète le dernier état
    snapshot_lock: tokio::sync::Mutex<()>,
    push_seq: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Value::Object(Map::new())),
            snapshot_path: None,
            snapshot_lock: tokio::sync::Mutex::new(()),
            push_seq: AtomicU64::new(0),
        }
    }

    /// Ouvre un store adossé à un fichier snapshot (créé si absent)
    pub fn open<P: Into<PathBuf>>(snapshot_path: P) -> Result<Self, StoreError> {
        let path = snapshot_path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, "{}")?;
        }

        let content = std::fs::read_to_string(&path)?;
        let root: Value = if content.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&content)?
        };

        info!("[store] memory store loaded from {:?}", path);
        Ok(Self {
            root: Mutex::new(root),
            snapshot_path: Some(path),
            snapshot_lock: tokio::sync::Mutex::new(()),
            push_seq: AtomicU64::new(0),
        })
    }

    /// Copie complète de l'arbre (tests et debug)
    pub fn dump(&self) -> Value {
        self.root.lock().clone()
    }

    async fn save_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else { return Ok(()) };
        let _guard = self.snapshot_lock.lock().await;
        let json = {
            let root = self.root.lock();
            serde_json::to_string_pretty(&*root)?
        };
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    fn next_push_key(&self) -> String {
        let millis = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        let seq = self.push_seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        format!("{millis:013}{seq:06}")
    }
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |node, seg| node.as_object()?.get(*seg))
}

/// Descend jusqu'au noeud, en créant (ou écrasant) les intermédiaires non-objets
fn lookup_mut<'a>(root: &'a mut Value, segments: &[&str]) -> &'a mut Value {
    let mut node = root;
    for seg in segments {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = &mut node[*seg];
    }
    node
}

fn remove_at(root: &mut Value, segments: &[&str]) {
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut node = root;
    for seg in parents {
        match node.as_object_mut().and_then(|m| m.get_mut(*seg)) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let Some(map) = node.as_object_mut() {
        map.remove(*last);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segments = split_path(path)?;
        let root = self.root.lock();
        Ok(lookup(&root, &segments).filter(|v| !v.is_null()).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments = split_path(path)?;
        {
            let mut root = self.root.lock();
            if value.is_null() {
                remove_at(&mut root, &segments);
            } else {
                *lookup_mut(&mut root, &segments) = value;
            }
        }
        debug!("[store] set {}", path);
        self.save_snapshot().await
    }

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError> {
        let segments = split_path(path)?;
        {
            let mut root = self.root.lock();
            let node = lookup_mut(&mut root, &segments);
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                for (key, value) in partial {
                    if value.is_null() {
                        map.remove(&key);
                    } else {
                        map.insert(key, value);
                    }
                }
            }
        }
        debug!("[store] update {}", path);
        self.save_snapshot().await
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let segments = split_path(path)?;
        let key = self.next_push_key();
        {
            let mut root = self.root.lock();
            let mut full = segments.clone();
            full.push(&key);
            *lookup_mut(&mut root, &full) = value;
        }
        debug!("[store] push {}/{}", path, key);
        self.save_snapshot().await?;
        Ok(key)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_nested() {
        let store = MemoryStore::new();
        store.set("devices/d1", json!({"device_id": "d1"})).await.unwrap();
        assert_eq!(store.get("devices/d1/device_id").await.unwrap(), Some(json!("d1")));
        assert_eq!(store.get("devices/d2").await.unwrap(), None);
        assert_eq!(store.get("devices").await.unwrap(), Some(json!({"d1": {"device_id": "d1"}})));
    }

    #[tokio::test]
    async fn test_update_merges_one_level() {
        let store = MemoryStore::new();
        store
            .set("devices/d1", json!({"status": "active", "device_info": {"model": "A", "os": "14"}}))
            .await
            .unwrap();

        let mut partial = Map::new();
        partial.insert("status".into(), json!("offline"));
        partial.insert("device_info".into(), json!({"model": "B"}));
        store.update("devices/d1", partial).await.unwrap();

        // Un seul niveau : device_info est remplacé en entier
        assert_eq!(
            store.get("devices/d1").await.unwrap(),
            Some(json!({"status": "offline", "device_info": {"model": "B"}}))
        );
    }

    #[tokio::test]
    async fn test_set_null_removes() {
        let store = MemoryStore::new();
        store.set("a/b", json!(1)).await.unwrap();
        store.set("a/b", Value::Null).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_generates_unique_increasing_keys() {
        let store = MemoryStore::new();
        let k1 = store.push("telemetry/d1/gps", json!({"n": 1})).await.unwrap();
        let k2 = store.push("telemetry/d1/gps", json!({"n": 2})).await.unwrap();
        assert_ne!(k1, k2);
        assert!(k1 < k2);

        let children = store.get("telemetry/d1/gps").await.unwrap().unwrap();
        assert_eq!(children.as_object().unwrap().len(), 2);
        assert_eq!(children[&k2], json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_set_overwrites_scalar_intermediate() {
        let store = MemoryStore::new();
        store.set("a", json!("scalar")).await.unwrap();
        store.set("a/b", json!(true)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"b": true})));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.set("commands/d1", json!({"pending": [], "executed": []})).await.unwrap();
            store.push("telemetry/d1/sms", json!({"payload": "{}"})).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("commands/d1").await.unwrap(),
            Some(json!({"pending": [], "executed": []}))
        );
        assert!(reopened.get("telemetry/d1/sms").await.unwrap().is_some());
    }
}
