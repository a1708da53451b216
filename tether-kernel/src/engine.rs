/**
 * SYNC ENGINE - Assemblage des composants autour d'un Record Store
 *
 * RÔLE : Construit registre, file de commandes, ingestion et console sur des
 * dépendances partagées (store, horloge, push, verrous) et expose les
 * opérations composées appelées par les handlers HTTP.
 */

use crate::clock::SharedClock;
use crate::codec::PayloadCodec;
use crate::config::KernelConfig;
use crate::console::Console;
use crate::error::{EngineError, EngineResult};
use crate::ingest::Ingestor;
use crate::models::{Command, Device};
use crate::push::SharedPush;
use crate::queue::CommandQueue;
use crate::registry::DeviceRegistry;
use crate::state::KeyedLocks;
use crate::store::SharedStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct SyncEngine {
    pub registry: Arc<DeviceRegistry>,
    pub queue: Arc<CommandQueue>,
    pub ingestor: Arc<Ingestor>,
    pub console: Arc<Console>,
    store: SharedStore,
    initial_commands: Arc<Vec<Value>>,
}

impl SyncEngine {
    pub fn new(store: SharedStore, push: SharedPush, clock: SharedClock, cfg: &KernelConfig) -> EngineResult<Self> {
        let codec = PayloadCodec::new(cfg.codec.key.as_bytes())?;
        let locks = KeyedLocks::new();
        let offline_after = Duration::seconds(cfg.presence.offline_after_secs);

        let registry = Arc::new(DeviceRegistry::new(store.clone(), clock.clone(), locks.clone(), offline_after));
        let queue = Arc::new(CommandQueue::new(store.clone(), clock.clone(), locks, push, registry.clone()));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            clock,
            registry.clone(),
            codec.clone(),
            cfg.codec.decrypt_uploads,
        ));
        let console = Arc::new(Console::new(store.clone(), registry.clone(), queue.clone(), codec));

        Ok(Self {
            registry,
            queue,
            ingestor,
            console,
            store,
            initial_commands: Arc::new(cfg.initial_commands.clone()),
        })
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Registration device : renvoie le device et les commandes de démarrage
    pub async fn register(&self, device_id: &str, device_info: Map<String, Value>) -> EngineResult<(Device, Vec<Value>)> {
        let device = self.registry.register(device_id, device_info).await?;
        Ok((device, self.initial_commands.as_ref().clone()))
    }

    /// Poll device : check-in puis vidage de la file
    pub async fn poll(&self, device_id: &str) -> EngineResult<Vec<Command>> {
        if device_id.is_empty() {
            return Err(EngineError::validation("Missing device_id"));
        }
        if let Err(e) = self.registry.touch(device_id).await {
            match e {
                EngineError::Store(_) => return Err(e),
                other => warn!("[engine] poll sans check-in pour {}: {}", device_id, other),
            }
        }
        self.queue.drain_pending(device_id).await
    }

    /// Ack d'un résultat de commande ; compte aussi comme check-in
    pub async fn acknowledge(&self, device_id: &str, command_id: &str, result: Option<Value>) -> EngineResult<Command> {
        let cmd = self.queue.mark_executed(device_id, command_id, result).await?;
        if let Err(e) = self.registry.touch(device_id).await {
            warn!("[engine] touch après ack en échec pour {}: {}", device_id, e);
        }
        Ok(cmd)
    }
}
