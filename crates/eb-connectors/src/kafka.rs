//! Kafka connector: `rdkafka` `StreamConsumer` source, `FutureProducer`
//! target. The consumer loop and JSON-agnostic byte payload follow the
//! shape of a plain Kafka consumer; offsets are auto-committed rather than
//! tracked per message, since Kafka has no per-record application ack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Headers;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use rdkafka::Message as KafkaMessageExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct KafkaSourceConfig {
    #[validate(length(min = 1))]
    pub brokers: String,
    #[validate(length(min = 1))]
    pub group_id: String,
    #[validate(length(min = 1))]
    pub topic: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct KafkaTargetConfig {
    #[validate(length(min = 1))]
    pub brokers: String,
    #[validate(length(min = 1))]
    pub topic: String,
}

/// Kafka has no per-message application ack beyond offset commit (handled
/// by `enable.auto.commit`) and no reply channel.
struct KafkaAdapter;

#[async_trait]
impl SourceAdapter for KafkaAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("kafka messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("kafka messages carry payload eagerly"))
    }
    async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reply(&self, _id: &[u8], _reply: ReplyData) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub struct KafkaSource {
    config: KafkaSourceConfig,
    cancel: Option<CancellationToken>,
}

impl KafkaSource {
    fn new(config: KafkaSourceConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for KafkaSource {
    fn name(&self) -> &str {
        "kafka"
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
        consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let adapter: Arc<dyn SourceAdapter> = Arc::new(KafkaAdapter);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = consumer.recv() => {
                        match result {
                            Ok(borrowed) => {
                                let mut metadata = HashMap::new();
                                metadata.insert("topic".to_string(), borrowed.topic().to_string());
                                metadata.insert("partition".to_string(), borrowed.partition().to_string());
                                metadata.insert("offset".to_string(), borrowed.offset().to_string());
                                if let Some(headers) = borrowed.headers() {
                                    for i in 0..headers.count() {
                                        let header = headers.get(i);
                                        if let Some(value) = header.value {
                                            if let Ok(v) = std::str::from_utf8(value) {
                                                metadata.insert(header.key.to_string(), v.to_string());
                                            }
                                        }
                                    }
                                }
                                let payload = borrowed.payload().unwrap_or(&[]).to_vec();
                                let id = format!("{}-{}-{}", borrowed.topic(), borrowed.partition(), borrowed.offset())
                                    .into_bytes();
                                let msg = Message::with_source_data(id, adapter.clone(), metadata, payload);
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "kafka consumer error");
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
    let config: KafkaSourceConfig = crate::parse_options("kafka", options)?;
    Ok(Box::new(KafkaSource::new(config)))
}

pub struct KafkaTarget {
    producer: FutureProducer,
    topic: String,
}

impl Operator for KafkaTarget {
    fn name(&self) -> &str {
        "kafka"
    }
}

#[async_trait]
impl Target for KafkaTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        let record: FutureRecord<(), [u8]> = FutureRecord::to(&self.topic).payload(&data);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| EventBridgeError::TargetConsume(anyhow::anyhow!(err)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: KafkaTargetConfig = crate::parse_options("kafka", options)?;
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()?;
    Ok(Box::new(KafkaTarget {
        producer,
        topic: config.topic,
    }))
}
