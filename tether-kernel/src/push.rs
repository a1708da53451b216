/**
 * PUSH DELIVERY - Chemin rapide best-effort pour réveiller un device
 *
 * RÔLE : À l'enqueue, si le device a enregistré un token push, on lui envoie la
 * commande directement. L'échec n'a aucune conséquence : la commande reste dans
 * la file et sera livrée au prochain poll.
 */

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push delivery disabled")]
    Disabled,
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("push rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, data: &Map<String, Value>) -> Result<(), PushError>;
}

pub type SharedPush = Arc<dyn PushSender>;

/// Push désactivé : chaque envoi échoue proprement (la file reste la seule voie)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPush;

#[async_trait]
impl PushSender for NoopPush {
    async fn send(&self, _token: &str, _data: &Map<String, Value>) -> Result<(), PushError> {
        Err(PushError::Disabled)
    }
}

/// Push via broker MQTT : un topic par token, "{prefix}/{token}"
#[derive(Clone)]
pub struct MqttPush {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttPush {
    pub fn new(client: AsyncClient, topic_prefix: &str) -> Self {
        Self {
            client,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn topic_for(&self, token: &str) -> String {
        format!("{}/{}", self.topic_prefix, crate::store::sanitize_key(token))
    }
}

#[async_trait]
impl PushSender for MqttPush {
    async fn send(&self, token: &str, data: &Map<String, Value>) -> Result<(), PushError> {
        let topic = self.topic_for(token);
        let payload = serde_json::to_vec(data)?;
        let size = payload.len();
        self.client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await?;
        debug!("[push] published {} bytes to {}", size, topic);
        Ok(())
    }
}
