/**
 * DEVICE REGISTRY - Identité, présence et statistiques de check-in des devices
 *
 * RÔLE : Seul propriétaire des enregistrements "devices/{id}" du Record Store.
 * - register : idempotent, merge device_info, initialise la file de commandes au 1er passage
 * - touch    : met à jour last_seen + moyenne glissante des intervalles de check-in
 * - get/list : statut recalculé à la lecture (seuil offline_after, 900s par défaut)
 *
 * CONCURRENCE : chaque read-modify-write d'un device passe par le verrou "device:{id}".
 * Ordre des verrous : device puis queue, jamais l'inverse.
 */

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::models::{CommandQueueState, Device, DeviceStatus, UNKNOWN_DEVICE, UNKNOWN_MODEL};
use crate::state::KeyedLocks;
use crate::store::{path_of, SharedStore};
use serde_json::{json, Map, Value};
use time::Duration;
use tracing::{debug, info, warn};

pub struct DeviceRegistry {
    store: SharedStore,
    clock: SharedClock,
    locks: KeyedLocks,
    offline_after: Duration,
}

pub(crate) fn device_lock_key(device_id: &str) -> String {
    format!("device:{device_id}")
}

pub(crate) fn queue_lock_key(device_id: &str) -> String {
    format!("queue:{device_id}")
}

fn device_path(device_id: &str) -> String {
    path_of(&["devices", device_id])
}

/// Les anciens enregistrements n'ont pas toujours device_id : la clé fait foi
fn parse_device(key: &str, mut value: Value) -> Option<Device> {
    let map = value.as_object_mut()?;
    map.entry("device_id").or_insert_with(|| json!(key));
    match serde_json::from_value(value) {
        Ok(device) => Some(device),
        Err(e) => {
            warn!("[registry] enregistrement device {} illisible: {}", key, e);
            None
        }
    }
}

fn placeholder_info() -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("model".into(), json!(UNKNOWN_MODEL));
    info.insert("android_version".into(), json!("Unknown"));
    info
}

impl DeviceRegistry {
    pub fn new(store: SharedStore, clock: SharedClock, locks: KeyedLocks, offline_after: Duration) -> Self {
        Self { store, clock, locks, offline_after }
    }

    async fn load(&self, device_id: &str) -> EngineResult<Option<Device>> {
        let raw = self.store.get(&device_path(device_id)).await?;
        Ok(raw.and_then(|v| parse_device(device_id, v)))
    }

    async fn save(&self, device: &Device) -> EngineResult<()> {
        let value = serde_json::to_value(device)?;
        self.store.set(&device_path(&device.device_id), value).await?;
        Ok(())
    }

    /// Enregistre ou met à jour un device (merge de device_info)
    pub async fn register(&self, device_id: &str, device_info: Map<String, Value>) -> EngineResult<Device> {
        if device_id.is_empty() {
            return Err(EngineError::validation("Missing device_id"));
        }
        let _guard = self.locks.lock(&device_lock_key(device_id)).await;
        self.register_locked(device_id, device_info).await
    }

    async fn register_locked(&self, device_id: &str, device_info: Map<String, Value>) -> EngineResult<Device> {
        let now = self.clock.now();

        let device = match self.load(device_id).await? {
            Some(mut existing) => {
                existing.device_info.extend(device_info);
                existing.last_seen = Some(now);
                existing.status = DeviceStatus::Active;
                self.save(&existing).await?;
                debug!("[registry] device {} re-registered", device_id);
                existing
            }
            None => {
                let mut info = device_info;
                if !info.get("model").map(|m| m.is_string()).unwrap_or(false) {
                    info.insert("model".into(), json!(UNKNOWN_MODEL));
                }
                let device = Device::new(device_id, info, now);
                self.save(&device).await?;
                self.init_queue(device_id).await?;
                info!("[registry] registered new device {}", device_id);
                device
            }
        };
        Ok(device)
    }

    /// Crée la file vide sauf si des commandes ont déjà été mises en file avant la registration
    async fn init_queue(&self, device_id: &str) -> EngineResult<()> {
        let _guard = self.locks.lock(&queue_lock_key(device_id)).await;
        let path = path_of(&["commands", device_id]);
        if self.store.get(&path).await?.is_none() {
            let empty = serde_json::to_value(CommandQueueState::default())?;
            self.store.set(&path, empty).await?;
        }
        Ok(())
    }

    /// Check-in d'un device : last_seen + statistiques d'intervalle
    pub async fn touch(&self, device_id: &str) -> EngineResult<Device> {
        if device_id.is_empty() || device_id == UNKNOWN_DEVICE {
            return Err(EngineError::validation("Cannot touch an unidentified device"));
        }
        let _guard = self.locks.lock(&device_lock_key(device_id)).await;

        let Some(mut device) = self.load(device_id).await? else {
            return self.register_locked(device_id, Map::new()).await;
        };

        let now = self.clock.now();
        let delta = device
            .last_seen
            .map(|prev| (now - prev).as_seconds_f64().max(0.0))
            .unwrap_or(0.0);

        let stats = &mut device.statistics;
        stats.check_ins += 1;
        let n = stats.check_ins as f64;
        stats.avg_interval = (stats.avg_interval * (n - 1.0) + delta) / n;
        stats.last_interval = delta;

        device.last_seen = Some(now);
        device.status = DeviceStatus::Active;
        self.save(&device).await?;
        debug!("[registry] touch {} (check-in #{}, Δt={:.1}s)", device_id, device.statistics.check_ins, delta);
        Ok(device)
    }

    pub async fn get(&self, device_id: &str) -> EngineResult<Device> {
        let mut device = self
            .load(device_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("device {device_id}")))?;
        device.refresh_status(self.clock.now(), self.offline_after);
        Ok(device)
    }

    pub async fn list(&self) -> EngineResult<Vec<Device>> {
        let now = self.clock.now();
        let Some(Value::Object(all)) = self.store.get("devices").await? else {
            return Ok(Vec::new());
        };

        let mut devices: Vec<Device> = all
            .into_iter()
            .filter_map(|(key, value)| parse_device(&key, value))
            .map(|mut device| {
                device.refresh_status(now, self.offline_after);
                if device.device_info.is_empty() {
                    device.device_info = placeholder_info();
                }
                device
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    pub async fn count(&self) -> EngineResult<usize> {
        Ok(match self.store.get("devices").await? {
            Some(Value::Object(all)) => all.len(),
            _ => 0,
        })
    }

    /// Associe un token push au device (enregistré à la volée si inconnu)
    pub async fn set_push_token(&self, device_id: &str, token: &str) -> EngineResult<Device> {
        if device_id.is_empty() || token.is_empty() {
            return Err(EngineError::validation("Missing device_id or fcm_token"));
        }
        let _guard = self.locks.lock(&device_lock_key(device_id)).await;

        let mut device = match self.load(device_id).await? {
            Some(device) => device,
            None => self.register_locked(device_id, Map::new()).await?,
        };
        device.push_token = Some(token.to_string());
        device.last_seen = Some(self.clock.now());
        device.status = DeviceStatus::Active;

        // Seuls le token et la présence changent : merge partiel, le reste de la fiche est intact
        let doc = serde_json::to_value(&device)?;
        let partial: Map<String, Value> = ["push_token", "last_seen", "status"]
            .into_iter()
            .filter_map(|field| doc.get(field).map(|v| (field.to_string(), v.clone())))
            .collect();
        self.store.update(&device_path(device_id), partial).await?;
        info!("[registry] push token registered for {}", device_id);
        Ok(device)
    }

    pub async fn push_token(&self, device_id: &str) -> EngineResult<Option<String>> {
        Ok(self.load(device_id).await?.and_then(|d| d.push_token))
    }
}
