/**
 * RECORD STORE - Interface de persistance arborescente adressée par chemin
 *
 * RÔLE :
 * Tout l'état devices/commandes/télémétrie vit ici, jamais dans le process.
 * Le kernel ne fait que du read-modify-write par chemin ("devices/abc", "commands/abc").
 *
 * OPÉRATIONS :
 * - get(path)            -> sous-arbre ou None
 * - set(path, value)     -> remplace le sous-arbre (Null = suppression)
 * - update(path, map)    -> merge sur un seul niveau
 * - push(path, value)    -> ajoute un enfant sous une clé unique générée
 *
 * BACKENDS :
 * - MemoryStore : arbre en mémoire + snapshot JSON optionnel
 * - RestStore   : arbre distant JSON-over-HTTP ("{base}/{path}.json")
 */

pub mod memory;
pub mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store answered {status} for {path}")]
    Status { status: u16, path: String },
    #[error("unexpected response: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError>;

    /// Retourne la clé générée pour le nouvel enfant
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn RecordStore>;

/// Remplace les caractères interdits dans une clé d'arbre
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '#' | '$' | '[' | ']' | '/' => '_',
            other => other,
        })
        .collect()
}

/// Assemble un chemin en assainissant chaque segment
pub fn path_of(segments: &[&str]) -> String {
    segments.iter().map(|s| sanitize_key(s)).collect::<Vec<_>>().join("/")
}

/// Assainit récursivement les clés d'un document JSON
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_key(&k), sanitize_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

pub(crate) fn split_path(path: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}
