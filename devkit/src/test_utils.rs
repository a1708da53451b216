/*!
Test Harness pour le moteur Tether

Assemble un `SyncEngine` complet sans dépendance externe :
- MemoryStore (optionnellement adossé à un snapshot)
- ManualClock pour piloter le temps
- RecordingPush pour observer les livraisons push
*/

use crate::push_stub::RecordingPush;
use anyhow::Result;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tether_kernel::clock::ManualClock;
use tether_kernel::config::KernelConfig;
use tether_kernel::ingest::{IngestOutcome, UploadHeaders};
use tether_kernel::models::{Command, Device};
use tether_kernel::store::MemoryStore;
use tether_kernel::SyncEngine;
use time::macros::datetime;
use time::OffsetDateTime;

pub const START: OffsetDateTime = datetime!(2024-06-01 09:00 UTC);

/// Harness de test complet pour le moteur
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub push: RecordingPush,
    pub engine: SyncEngine,
}

impl TestHarness {
    /// Crée un harness avec la configuration par défaut
    pub fn new() -> Result<Self> {
        Self::with_config(&KernelConfig::default())
    }

    pub fn with_config(cfg: &KernelConfig) -> Result<Self> {
        Self::build(Arc::new(MemoryStore::new()), cfg)
    }

    /// Harness dont le store écrit dans un fichier snapshot
    pub fn with_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = MemoryStore::open(path.as_ref().to_path_buf())?;
        Self::build(Arc::new(store), &KernelConfig::default())
    }

    fn build(store: Arc<MemoryStore>, cfg: &KernelConfig) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let clock = ManualClock::new(START);
        let push = RecordingPush::new();
        let engine = SyncEngine::new(store.clone(), Arc::new(push.clone()), Arc::new(clock.clone()), cfg)?;
        Ok(Self { store, clock, push, engine })
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance_secs(secs);
    }

    pub async fn register(&self, device_id: &str) -> Result<Device> {
        let (device, _) = self.engine.register(device_id, Map::new()).await?;
        log::info!("📱 Registered test device: {}", device_id);
        Ok(device)
    }

    pub async fn enqueue(&self, device_id: &str, command: Value) -> Result<Command> {
        Ok(self.engine.queue.enqueue(device_id, command).await?)
    }

    pub async fn poll(&self, device_id: &str) -> Result<Vec<Command>> {
        Ok(self.engine.poll(device_id).await?)
    }

    pub async fn upload(&self, body: &[u8], headers: UploadHeaders) -> Result<IngestOutcome> {
        Ok(self.engine.ingestor.ingest(body, &headers).await?)
    }

    pub async fn upload_json(&self, doc: &Value) -> Result<IngestOutcome> {
        self.upload(doc.to_string().as_bytes(), UploadHeaders::default()).await
    }

    /// Copie de l'arbre complet du store
    pub fn dump(&self) -> Value {
        self.store.dump()
    }
}
