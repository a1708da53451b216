/*!
Push stub pour tests sans broker MQTT

Implémente `PushSender` en enregistrant chaque envoi en mémoire.
Peut être basculé en mode échec pour vérifier que la file reste la source de vérité.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_kernel::push::{PushError, PushSender};

#[derive(Debug, Clone, PartialEq)]
pub struct PushedMessage {
    pub token: String,
    pub data: Map<String, Value>,
}

#[derive(Clone, Default)]
pub struct RecordingPush {
    sent: Arc<Mutex<Vec<PushedMessage>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les envois suivants échouent (Rejected) tant que le flag reste actif
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Récupère tous les envois réussis (pour assertions de tests)
    pub fn sent(&self) -> Vec<PushedMessage> {
        self.sent.lock().clone()
    }

    pub fn find_by_token(&self, token: &str) -> Vec<PushedMessage> {
        self.sent.lock().iter().filter(|m| m.token == token).cloned().collect()
    }

    pub fn last_for(&self, token: &str) -> Option<PushedMessage> {
        self.find_by_token(token).pop()
    }

    /// Oublie les envois enregistrés (entre deux phases d'un même test)
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send(&self, token: &str, data: &Map<String, Value>) -> Result<(), PushError> {
        if self.failing.load(Ordering::Relaxed) {
            log::warn!("📵 [MOCK] push refusé pour {}", token);
            return Err(PushError::Rejected("recording push set to fail".into()));
        }
        self.sent.lock().push(PushedMessage { token: token.to_string(), data: data.clone() });
        log::info!("📤 [MOCK] push to {}: {} field(s)", token, data.len());
        Ok(())
    }
}
