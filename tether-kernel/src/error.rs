/**
 * ERREURS ENGINE - Taxonomie commune à tous les composants du kernel
 *
 * RÔLE : Une seule enum que chaque handler HTTP convertit en status à sa frontière.
 * Validation/NotFound -> 4xx avec message, Decode -> 4xx quand tous les fallbacks
 * ont échoué, Store -> 5xx générique (le détail reste dans les logs).
 */

use crate::codec::DecodeError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Decode(e.to_string())
    }
}

/// Un document illisible relu depuis le store est une panne interne, pas une faute client
impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Store(StoreError::Serialization(e))
    }
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    /// Corps client indécodable (JSON attendu)
    pub fn decode(e: impl std::fmt::Display) -> Self {
        EngineError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_failure_is_a_store_error() {
        let err: EngineError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, EngineError::Store(StoreError::Serialization(_))));
    }

    #[test]
    fn test_decode_helper_keeps_message() {
        let err = EngineError::decode("bad body");
        assert!(matches!(err, EngineError::Decode(ref m) if m == "bad body"));
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
