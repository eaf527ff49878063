// src/mqtt.rs - MQTT live source and reading sink

use crate::config::MqttConfig;
use crate::error::{PipelineError, Result};
use crate::normalizer::Reading;
use crate::reader::{LiveInput, RecordOrigin};
use crate::sink::ReadingSink;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn options(config: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user, pass);
    }
    options
}

fn client_error(e: rumqttc::ClientError) -> PipelineError {
    PipelineError::TransientSink(format!("mqtt: {}", e))
}

// ============================================================================
// SOURCE
// ============================================================================

/// Subscribes to reading topics and pushes decoded messages into a channel.
/// Payloads that do not decode travel the same channel as malformed items.
pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttSource {
    pub fn new(config: MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(options(&config, &format!("{}-source", config.client_id)), 100);
        Self { client, eventloop, config }
    }

    /// Poll the broker until the receiving side of `tx` is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<LiveInput>) -> Result<()> {
        for topic in &self.config.subscribe {
            self.client.subscribe(topic, QoS::AtLeastOnce).await.map_err(client_error)?;
            info!("Subscribed to {}", topic);
        }

        let mut received = 0usize;
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let origin = RecordOrigin::new(publish.topic.clone(), received);
                    received += 1;
                    for item in LiveInput::decode(&publish.payload, origin) {
                        if let LiveInput::Malformed(rejection) = &item {
                            warn!("Undecodable payload on {}: {}", publish.topic, rejection.detail);
                        }
                        if tx.send(item).await.is_err() {
                            info!("Live channel closed, MQTT source stopping");
                            return Ok(());
                        }
                    }
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    if tx.is_closed() {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Publishes normalized readings to `{publish_prefix}/{tag}` at QoS 1
pub struct MqttSink {
    client: AsyncClient,
    prefix: String,
    poller: JoinHandle<()>,
}

impl MqttSink {
    /// Create the client and spawn its event loop. Requires a tokio runtime.
    pub fn connect(config: &MqttConfig) -> Self {
        let (client, mut eventloop) = AsyncClient::new(options(config, &format!("{}-sink", config.client_id)), 100);
        let poller = tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!("MQTT sink connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        info!("MQTT sink publishing to {}:{} under {}", config.host, config.port, config.publish_prefix);
        Self { client, prefix: config.publish_prefix.clone(), poller }
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl ReadingSink for MqttSink {
    async fn publish(&self, readings: &[Reading]) -> Result<()> {
        for reading in readings {
            let topic = format!("{}/{}", self.prefix, reading.tag);
            let payload = serde_json::to_vec(reading)?;
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(client_error)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}
