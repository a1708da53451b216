/**
 * INGESTION - Transforme un blob uploadé par un device en enregistrement de télémétrie
 *
 * CASCADE :
 *   [déchiffrement optionnel] -> zlib (sinon brut) -> JSON objet ou binaire
 *   -> résolution du device_id -> enrichissement -> push "telemetry/{device}/{type}"
 *   -> touch du registre
 *
 * Aucune étape de décodage ne rejette l'upload : chaque échec retombe sur l'étape suivante.
 * Seule une panne du Record Store remonte à l'appelant.
 */

use crate::clock::SharedClock;
use crate::codec::PayloadCodec;
use crate::enrich::{self, nested_data, DataClass};
use crate::error::{EngineError, EngineResult};
use crate::models::{ts, TelemetryEntry, TelemetryMetadata, UNKNOWN_DEVICE};
use crate::registry::DeviceRegistry;
use crate::store::{path_of, sanitize_key, sanitize_value, SharedStore};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use serde_json::{json, Map, Value};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNKNOWN_TYPE: &str = "unknown";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const SOURCE: &str = "android_device";

/// Headers HTTP pertinents pour l'ingestion
#[derive(Debug, Clone, Default)]
pub struct UploadHeaders {
    pub data_type: Option<String>,
    pub device_id: Option<String>,
    pub content_type: Option<String>,
    pub encrypted: bool,
}

/// Corps d'upload après décompression
#[derive(Debug, Clone, PartialEq)]
pub enum Upload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Upload {
    /// JSON seulement si UTF-8 valide ET objet ; le reste est binaire
    pub fn detect(bytes: Vec<u8>) -> Self {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value @ Value::Object(_)) => Upload::Json(value),
            _ => Upload::Binary(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub device_id: String,
    pub data_type: String,
    pub key: String,
    pub binary: bool,
}

/// Décompression zlib ; en cas d'échec le corps est rendu tel quel
pub fn decompress(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match ZlibDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => {
            debug!("[ingest] zlib: {} -> {} bytes", body.len(), out.len());
            out
        }
        Err(_) => body.to_vec(),
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn usable_id(v: Option<&Value>) -> Option<String> {
    let id = match v? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty() && id != UNKNOWN_DEVICE).then_some(id)
}

/// Ordre : device_id racine -> device_id imbriqué -> client_id -> header -> sentinelle.
/// Le booléen indique si l'id provient du `data` imbriqué.
pub fn resolve_device_id(
    doc: &Map<String, Value>,
    nested: Option<&Map<String, Value>>,
    header: Option<&str>,
) -> (String, bool) {
    if let Some(id) = usable_id(doc.get("device_id")) {
        return (id, false);
    }
    if let Some(id) = nested.and_then(|n| usable_id(n.get("device_id"))) {
        return (id, true);
    }
    if let Some(id) = usable_id(doc.get("client_id")) {
        return (id, false);
    }
    if let Some(id) = non_empty(header).filter(|h| h != UNKNOWN_DEVICE) {
        return (id, false);
    }
    (UNKNOWN_DEVICE.to_string(), false)
}

/// Infos device portées par le `data` imbriqué (model/android_version/manufacturer)
fn nested_device_info(nested: &Map<String, Value>) -> Map<String, Value> {
    let mut info = Map::new();
    for (from, to) in [
        ("device_model", "model"),
        ("android_version", "android_version"),
        ("manufacturer", "manufacturer"),
    ] {
        if let Some(v) = nested.get(from) {
            info.insert(to.to_string(), v.clone());
        }
    }
    info
}

/// Type tel qu'il sera rangé dans le store : même valeur dans le chemin, les métadonnées et le résultat
fn storable_type(raw: Option<String>) -> String {
    raw.map(|t| sanitize_key(&t)).unwrap_or_else(|| UNKNOWN_TYPE.to_string())
}

pub struct Ingestor {
    store: SharedStore,
    clock: SharedClock,
    registry: Arc<DeviceRegistry>,
    codec: PayloadCodec,
    decrypt_uploads: bool,
}

impl Ingestor {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        registry: Arc<DeviceRegistry>,
        codec: PayloadCodec,
        decrypt_uploads: bool,
    ) -> Self {
        Self { store, clock, registry, codec, decrypt_uploads }
    }

    pub async fn ingest(&self, body: &[u8], headers: &UploadHeaders) -> EngineResult<IngestOutcome> {
        let raw = if headers.encrypted || self.decrypt_uploads {
            match self.codec.decrypt(body) {
                Ok(plain) => plain,
                Err(e) => {
                    debug!("[ingest] déchiffrement ignoré: {}", e);
                    body.to_vec()
                }
            }
        } else {
            body.to_vec()
        };

        let outcome = match Upload::detect(decompress(&raw)) {
            Upload::Json(Value::Object(doc)) => self.ingest_json(doc, headers).await?,
            Upload::Json(other) => self.ingest_binary(other.to_string().into_bytes(), headers).await?,
            Upload::Binary(bytes) => self.ingest_binary(bytes, headers).await?,
        };

        if outcome.device_id != UNKNOWN_DEVICE {
            if let Err(e) = self.registry.touch(&outcome.device_id).await {
                warn!("[ingest] touch {} en échec: {}", outcome.device_id, e);
            }
        }

        info!(
            "[ingest] {} {} stocké pour {} ({})",
            if outcome.binary { "binaire" } else { "json" },
            outcome.data_type,
            outcome.device_id,
            outcome.key
        );
        Ok(outcome)
    }

    async fn ingest_json(&self, mut doc: Map<String, Value>, headers: &UploadHeaders) -> EngineResult<IngestOutcome> {
        let data_type = storable_type(
            non_empty(doc.get("type").and_then(Value::as_str)).or_else(|| non_empty(headers.data_type.as_deref())),
        );

        let nested = nested_data(&doc);
        let (device_id, _) = resolve_device_id(&doc, nested.as_ref(), headers.device_id.as_deref());

        // Les infos device imbriquées alimentent le registre dès que l'id imbriqué est exploitable,
        // même quand l'id racine l'emporte pour le stockage
        if let Some(nested) = &nested {
            if let Some(nested_id) = usable_id(nested.get("device_id")) {
                let info = nested_device_info(nested);
                if !info.is_empty() {
                    self.registry.register(&nested_id, info).await?;
                }
            }
        }

        enrich::enrich(&data_type, &mut doc);

        let now = self.clock.now();
        doc.insert("device_id".into(), json!(device_id));
        doc.insert("received_timestamp".into(), json!(ts::format(now)));

        let entry = TelemetryEntry {
            timestamp: Some(now),
            metadata: TelemetryMetadata {
                source: SOURCE.into(),
                data_type: data_type.clone(),
                device_id: device_id.clone(),
                content_type: None,
            },
            payload: serde_json::to_string(&doc)?,
        };
        let key = self.persist(&device_id, &data_type, &entry).await?;
        Ok(IngestOutcome { device_id, data_type, key, binary: false })
    }

    async fn ingest_binary(&self, bytes: Vec<u8>, headers: &UploadHeaders) -> EngineResult<IngestOutcome> {
        let data_type = storable_type(non_empty(headers.data_type.as_deref()));
        let device_id = non_empty(headers.device_id.as_deref()).unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let content_type =
            non_empty(headers.content_type.as_deref()).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let now = self.clock.now();
        let encoded = B64.encode(&bytes);
        let mut payload = Map::new();
        payload.insert("timestamp".into(), json!(ts::format(now)));
        payload.insert("type".into(), json!(data_type));
        payload.insert("device_id".into(), json!(device_id));
        payload.insert("content_type".into(), json!(content_type));
        payload.insert("data".into(), json!(encoded));
        if DataClass::of(&data_type).is_image() {
            payload.insert("image_data".into(), json!(encoded));
        }

        let entry = TelemetryEntry {
            timestamp: Some(now),
            metadata: TelemetryMetadata {
                source: SOURCE.into(),
                data_type: data_type.clone(),
                device_id: device_id.clone(),
                content_type: Some(content_type),
            },
            payload: serde_json::to_string(&payload)?,
        };
        let key = self.persist(&device_id, &data_type, &entry).await?;
        Ok(IngestOutcome { device_id, data_type, key, binary: true })
    }

    async fn persist(&self, device_id: &str, data_type: &str, entry: &TelemetryEntry) -> EngineResult<String> {
        let path = path_of(&["telemetry", device_id, data_type]);
        let key = self.store.push(&path, serde_json::to_value(entry)?).await?;
        Ok(key)
    }

    /// Analytics applicatives : JSON objet obligatoire
    pub async fn record_analytics(&self, client_id: &str, body: &[u8], client_ip: &str) -> EngineResult<String> {
        debug!("[ingest] analytics: {} bytes", body.len());
        let value: Value = serde_json::from_slice(body).map_err(EngineError::decode)?;
        let Value::Object(mut doc) = sanitize_value(value) else {
            return Err(EngineError::Decode("analytics body must be a JSON object".into()));
        };
        doc.insert("received_at".into(), json!(ts::format(self.clock.now())));
        doc.insert("client_ip".into(), json!(client_ip));

        let client = non_empty(Some(client_id)).unwrap_or_else(|| UNKNOWN_TYPE.to_string());
        let key = self.store.push(&path_of(&["analytics", &client]), Value::Object(doc)).await?;
        info!("[ingest] analytics enregistrées pour {}", client);
        Ok(key)
    }
}
