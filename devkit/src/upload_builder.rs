/*!
Builders d'uploads device

Construit les corps que les devices envoient sur /exfil : JSON plat, JSON avec
`data` imbriqué sérialisé en chaîne, et variantes compressées zlib.
*/

use anyhow::Result;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::Write;

pub struct UploadBuilder;

impl UploadBuilder {
    /// Position GPS à plat
    pub fn location(device_id: &str, latitude: f64, longitude: f64) -> Value {
        json!({
            "device_id": device_id,
            "type": "location_data",
            "latitude": latitude,
            "longitude": longitude
        })
    }

    /// Enveloppe dont le `data` est un document JSON sérialisé en chaîne
    pub fn nested(outer_device_id: &str, data_type: &str, inner: Value) -> Value {
        json!({
            "device_id": outer_device_id,
            "type": data_type,
            "data": inner.to_string()
        })
    }

    /// Enveloppe dont le `data` est une chaîne brute
    pub fn raw(device_id: &str, data_type: &str, data: &str) -> Value {
        json!({
            "device_id": device_id,
            "type": data_type,
            "data": data
        })
    }

    pub fn media(device_id: &str, files: &[&str]) -> Value {
        json!({
            "device_id": device_id,
            "type": "media_metadata",
            "media_files": files
        })
    }

    pub fn to_bytes(doc: &Value) -> Vec<u8> {
        doc.to_string().into_bytes()
    }

    /// Même document, compressé comme le fait le client (zlib, niveau par défaut)
    pub fn zlib(doc: &Value) -> Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&Self::to_bytes(doc))?;
        Ok(enc.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_data_is_a_string() {
        let doc = UploadBuilder::nested("unknown_device", "sms", json!({"device_id": "d9"}));
        let inner: Value = serde_json::from_str(doc["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["device_id"], "d9");
    }

    #[test]
    fn test_zlib_header() {
        let bytes = UploadBuilder::zlib(&UploadBuilder::location("d1", 1.0, 2.0)).unwrap();
        assert_eq!(bytes[0], 0x78);
    }
}
