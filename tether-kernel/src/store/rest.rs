/**
 * REST STORE - Record Store distant (arbre JSON exposé en HTTP)
 *
 * Protocole : chaque chemin est une ressource "{base_url}/{path}.json"
 *   GET   -> sous-arbre (null si absent)
 *   PUT   -> set
 *   PATCH -> update (merge un niveau)
 *   POST  -> push, la réponse contient {"name": "<clé générée>"}
 * Authentification optionnelle par paramètre de requête "auth".
 */

use super::{split_path, RecordStore, StoreError};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

pub struct RestStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl RestStore {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn resource_url(&self, path: &str) -> Result<String, StoreError> {
        let segments = split_path(path)?;
        Ok(format!("{}/{}.json", self.base_url, segments.join("/")))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, StoreError> {
        let url = self.resource_url(path)?;
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.query(&[("auth", token)]);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Value, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status { status: status.as_u16(), path: path.to_string() });
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let req = self.request(Method::GET, path)?;
        let value = self.send(req, path).await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let req = self.request(Method::PUT, path)?.json(&value);
        self.send(req, path).await?;
        debug!("[store] PUT {}", path);
        Ok(())
    }

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError> {
        let req = self.request(Method::PATCH, path)?.json(&partial);
        self.send(req, path).await?;
        debug!("[store] PATCH {}", path);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let req = self.request(Method::POST, path)?.json(&value);
        let answer = self.send(req, path).await?;
        let key = answer
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Protocol(format!("push to {path} returned no key")))?;
        debug!("[store] POST {} -> {}", path, key);
        Ok(key.to_string())
    }

    fn backend_name(&self) -> &'static str {
        "rest"
    }
}
