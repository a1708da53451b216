use crate::config::PushConf;
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions};
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};

/// Crée le client MQTT du push et lance la boucle d'événements qui le fait vivre
pub fn spawn_push_client(conf: &PushConf, health: HealthTracker) -> AsyncClient {
    let mut opts = MqttOptions::new("tether-kernel-push", &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    let broker = format!("{}:{}", conf.host, conf.port);
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("[mqtt] connected to {}", broker);
                    health.mark_mqtt_connected();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[mqtt] erreur: {:?}", e);
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    client
}
