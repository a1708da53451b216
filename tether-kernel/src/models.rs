use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

pub const UNKNOWN_DEVICE: &str = "unknown_device";
pub const UNKNOWN_MODEL: &str = "Unknown Device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Offline,
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Statut dérivé : actif tant que l'âge du dernier contact reste <= seuil
    pub fn derive(last_seen: Option<OffsetDateTime>, now: OffsetDateTime, offline_after: Duration) -> Self {
        match last_seen {
            Some(seen) if now - seen <= offline_after => DeviceStatus::Active,
            Some(_) => DeviceStatus::Offline,
            None => DeviceStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceStatistics {
    #[serde(default)]
    pub check_ins: u64,
    /// secondes
    #[serde(default)]
    pub avg_interval: f64,
    /// secondes
    #[serde(default)]
    pub last_interval: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    #[serde(default)]
    pub device_info: Map<String, Value>,
    #[serde(default, with = "ts")]
    pub registration_time: Option<OffsetDateTime>,
    #[serde(default, with = "ts")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub statistics: DeviceStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl Device {
    pub fn new(device_id: &str, device_info: Map<String, Value>, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_info,
            registration_time: Some(now),
            last_seen: Some(now),
            status: DeviceStatus::Active,
            statistics: DeviceStatistics::default(),
            push_token: None,
        }
    }

    pub fn refresh_status(&mut self, now: OffsetDateTime, offline_after: Duration) {
        self.status = DeviceStatus::derive(self.last_seen, now, offline_after);
    }
}

/// Commande opérateur. Les paramètres sont aplatis à côté du tag sur le fil :
/// {"id": "...", "command": "set_interval", "interval": 15, "created_at": "..."}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, with = "ts")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "ts", skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandQueueState {
    #[serde(default)]
    pub pending: Vec<Command>,
    #[serde(default)]
    pub executed: Vec<Command>,
}

/// Entrée de l'index command_results/{device}/{command_id}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    #[serde(default, with = "ts")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub command_type: String,
    #[serde(default, with = "ts")]
    pub executed_at: Option<OffsetDateTime>,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetadata {
    pub source: String,
    #[serde(rename = "dataType")]
    pub data_type: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Enregistrement de télémétrie : immuable une fois poussé dans le store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    #[serde(default, with = "ts")]
    pub timestamp: Option<OffsetDateTime>,
    pub metadata: TelemetryMetadata,
    pub payload: String,
}

/// Horodatages RFC 3339 en écriture ; en lecture on accepte aussi l'ISO 8601 sans
/// offset (interprété UTC) et on tolère les valeurs illisibles ("unknown" -> None).
pub mod ts {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn serialize<S: Serializer>(value: &Option<OffsetDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => {
                let txt = dt.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
                s.serialize_str(&txt)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<OffsetDateTime>, D::Error> {
        let raw: Option<serde_json::Value> = Option::deserialize(d)?;
        Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(parse))
    }

    pub fn parse(txt: &str) -> Option<OffsetDateTime> {
        if let Ok(dt) = OffsetDateTime::parse(txt, &Rfc3339) {
            return Some(dt);
        }
        let naive = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        );
        PrimitiveDateTime::parse(txt, naive).ok().map(|dt| dt.assume_utc())
    }

    pub fn format(dt: OffsetDateTime) -> String {
        dt.format(&Rfc3339).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_status_boundaries() {
        let now = datetime!(2024-03-01 12:00 UTC);
        let limit = Duration::seconds(900);
        assert_eq!(DeviceStatus::derive(Some(now - Duration::seconds(899)), now, limit), DeviceStatus::Active);
        assert_eq!(DeviceStatus::derive(Some(now - Duration::seconds(900)), now, limit), DeviceStatus::Active);
        assert_eq!(DeviceStatus::derive(Some(now - Duration::seconds(901)), now, limit), DeviceStatus::Offline);
        assert_eq!(DeviceStatus::derive(None, now, limit), DeviceStatus::Unknown);
    }

    #[test]
    fn test_command_params_are_flattened() {
        let cmd: Command = serde_json::from_value(json!({
            "id": "c1",
            "command": "set_interval",
            "interval": 15,
            "created_at": "2024-03-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(cmd.command, "set_interval");
        assert_eq!(cmd.params.get("interval"), Some(&json!(15)));

        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["interval"], json!(15));
        assert!(back.get("executed_at").is_none());
    }

    #[test]
    fn test_legacy_naive_timestamps_are_read_as_utc() {
        let dev: Device = serde_json::from_value(json!({
            "device_id": "d1",
            "last_seen": "2024-03-01T12:00:00.123456",
            "registration_time": "unknown"
        }))
        .unwrap();
        assert_eq!(dev.last_seen.unwrap().unix_timestamp(), datetime!(2024-03-01 12:00 UTC).unix_timestamp());
        assert_eq!(dev.registration_time, None);
        assert_eq!(dev.status, DeviceStatus::Unknown);
    }

    #[test]
    fn test_telemetry_metadata_wire_names() {
        let meta = TelemetryMetadata {
            source: "device".into(),
            data_type: "gps".into(),
            device_id: "d1".into(),
            content_type: None,
        };
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({"source": "device", "dataType": "gps", "deviceId": "d1"})
        );
    }
}
