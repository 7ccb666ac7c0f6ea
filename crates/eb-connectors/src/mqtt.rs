//! MQTT connector built on `rumqttc`'s async client. Source subscribes and
//! forwards `Publish` packets; target publishes; reply-to-source publishes
//! on a per-message reply topic derived from the originating topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn default_client_id() -> String {
    format!("events-bridge-{}", Uuid::new_v4())
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct MqttSourceConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default = "default_client_id")]
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub topic: String,
    #[serde(default = "default_qos")]
    #[validate(range(max = 2))]
    pub qos: u8,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MqttTargetConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default = "default_client_id")]
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub topic: String,
    #[serde(default = "default_qos")]
    #[validate(range(max = 2))]
    pub qos: u8,
}

/// MQTT has no application-level ack/nak distinct from QoS delivery, so
/// `ack`/`nak` are no-ops here (the at-least-once baseline comes from QoS
/// 1/2 on the broker side); `reply` publishes to `{topic}/reply`.
struct MqttAdapter {
    client: AsyncClient,
    reply_topics: Mutex<HashMap<Vec<u8>, String>>,
}

impl MqttAdapter {
    async fn register_reply_topic(&self, id: Vec<u8>, topic: String) {
        self.reply_topics.lock().await.insert(id, topic);
    }
}

#[async_trait]
impl SourceAdapter for MqttAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("mqtt messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("mqtt messages carry payload eagerly"))
    }
    async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reply(&self, id: &[u8], reply: ReplyData) -> anyhow::Result<bool> {
        let topic = self.reply_topics.lock().await.remove(id);
        match topic {
            Some(topic) => {
                self.client
                    .publish(topic, QoS::AtLeastOnce, false, reply.payload)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct MqttSource {
    config: MqttSourceConfig,
    cancel: Option<CancellationToken>,
}

impl MqttSource {
    fn new(config: MqttSourceConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for MqttSource {
    fn name(&self) -> &str {
        "mqtt"
    }
}

#[async_trait]
impl Source for MqttSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let mut opts = MqttOptions::new(self.config.client_id.clone(), self.config.host.clone(), self.config.port);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(opts, buffer.max(10));
        client
            .subscribe(&self.config.topic, qos_from(self.config.qos))
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let adapter = Arc::new(MqttAdapter {
            client,
            reply_topics: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let id = Uuid::new_v4().as_bytes().to_vec();
                                let mut metadata = HashMap::new();
                                metadata.insert("topic".to_string(), publish.topic.clone());
                                let reply_topic = format!("{}/reply", publish.topic);
                                adapter.register_reply_topic(id.clone(), reply_topic).await;
                                let adapter_dyn: Arc<dyn SourceAdapter> = adapter.clone();
                                let msg = Message::with_source_data(id, adapter_dyn, metadata, publish.payload.to_vec());
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(error = %err, "mqtt connection error");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }
}

pub fn build_source(options: Value) -> anyhow::Result<Box<dyn Source>> {
    let config: MqttSourceConfig = crate::parse_options("mqtt", options)?;
    Ok(Box::new(MqttSource::new(config)))
}

pub struct MqttTarget {
    client: AsyncClient,
    eventloop_handle: JoinHandle<()>,
    topic: String,
    qos: QoS,
}

impl Operator for MqttTarget {
    fn name(&self) -> &str {
        "mqtt"
    }
}

#[async_trait]
impl Target for MqttTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        self.client
            .publish(&self.topic, self.qos, false, data)
            .await
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.eventloop_handle.abort();
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: MqttTargetConfig = crate::parse_options("mqtt", options)?;
    let opts = MqttOptions::new(config.client_id, config.host, config.port);
    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "mqtt target connection error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
    Ok(Box::new(MqttTarget {
        client,
        eventloop_handle: handle,
        topic: config.topic,
        qos: qos_from(config.qos),
    }))
}
