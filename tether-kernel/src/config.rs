use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub store: StoreConf,
    pub push: PushConf,
    pub codec: CodecConf,
    pub presence: PresenceConf,
    /// Commandes renvoyées au device dans la réponse de /register
    pub initial_commands: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rest,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    /// memory : fichier snapshot JSON (aucune persistance si absent)
    pub snapshot_path: Option<String>,
    /// rest : racine de l'arbre distant
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PushConf {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CodecConf {
    pub key: String,
    /// Tente le déchiffrement de tous les uploads, même sans header X-Encrypted
    pub decrypt_uploads: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PresenceConf {
    pub offline_after_secs: i64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            store: StoreConf::default(),
            push: PushConf::default(),
            codec: CodecConf::default(),
            presence: PresenceConf::default(),
            initial_commands: vec![
                json!({"command": "set_interval", "interval": 15}),
                json!({"command": "collect_info"}),
            ],
        }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:42069".into() }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            snapshot_path: Some("./data/store.json".into()),
            base_url: None,
            auth_token: None,
            timeout_secs: 10,
        }
    }
}

impl Default for PushConf {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".into(),
            port: 1883,
            topic_prefix: "tether/push".into(),
        }
    }
}

impl Default for CodecConf {
    fn default() -> Self {
        Self {
            key: crate::codec::DEFAULT_KEY.into(),
            decrypt_uploads: false,
        }
    }
}

impl Default for PresenceConf {
    fn default() -> Self {
        Self { offline_after_secs: 900 }
    }
}

impl KernelConfig {
    /// Applique les surcharges par variables d'environnement
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("TETHER_BIND") {
            self.server.bind = bind;
        }
        if let Ok(url) = std::env::var("TETHER_STORE_URL") {
            self.store.backend = StoreBackend::Rest;
            self.store.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("TETHER_CODEC_KEY") {
            self.codec.key = key;
        }
    }
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[kernel] config invalide: {e}");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("TETHER_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        warn!("[kernel] pas de {path}, usage config par défaut");
        KernelConfig::default()
    };
    cfg.apply_env();
    cfg
}
