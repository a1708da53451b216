/**
 * TETHER KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Bootstrap complet : .env, logs, config YAML, Record Store, push MQTT optionnel,
 * moteur de synchronisation puis serveur HTTP.
 */

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tether_kernel::clock::SystemClock;
use tether_kernel::config::{load_config, StoreBackend, StoreConf};
use tether_kernel::health::HealthTracker;
use tether_kernel::http::{self, AppState};
use tether_kernel::mqtt::spawn_push_client;
use tether_kernel::push::{MqttPush, NoopPush, SharedPush};
use tether_kernel::store::{MemoryStore, RestStore, SharedStore};
use tether_kernel::SyncEngine;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn open_store(conf: &StoreConf) -> anyhow::Result<SharedStore> {
    match conf.backend {
        StoreBackend::Memory => match &conf.snapshot_path {
            Some(path) => Ok(Arc::new(
                MemoryStore::open(path).with_context(|| format!("ouverture du snapshot {path}"))?,
            )),
            None => {
                warn!("[kernel] memory store sans snapshot : aucune persistance");
                Ok(Arc::new(MemoryStore::new()))
            }
        },
        StoreBackend::Rest => {
            let Some(base_url) = conf.base_url.as_deref() else {
                bail!("store.backend = rest mais store.base_url absent");
            };
            let store = RestStore::new(base_url, conf.auth_token.clone(), Duration::from_secs(conf.timeout_secs))?;
            info!("[kernel] rest store sur {}", base_url);
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let health_tracker = HealthTracker::new();
    let store = open_store(&cfg.store)?;

    let push: SharedPush = if cfg.push.enabled {
        health_tracker.mark_mqtt_connecting();
        let client = spawn_push_client(&cfg.push, health_tracker.clone());
        Arc::new(MqttPush::new(client, &cfg.push.topic_prefix))
    } else {
        info!("[kernel] push désactivé : livraison par poll uniquement");
        Arc::new(NoopPush)
    };

    let engine = SyncEngine::new(store, push, Arc::new(SystemClock), &cfg).context("initialisation du moteur")?;

    let api_key = std::env::var("TETHER_API_KEY").ok().filter(|k| !k.is_empty()).map(Arc::<str>::from);
    if api_key.is_none() {
        warn!("[kernel] TETHER_API_KEY absent : routes opérateur fermées");
    }

    let app_state = AppState { engine, health_tracker, api_key };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("bind {}", cfg.server.bind))?;
    info!("[kernel] listening on http://{}", cfg.server.bind);
    http::serve(listener, app).await?;
    Ok(())
}
