//! Redis connector. Source reads from a pub/sub channel or polls a list
//! with `BLPOP`, selected by `mode`; target publishes or pushes the same
//! way. Redis gives neither mode a per-message application ack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

fn default_mode() -> String {
    "pubsub".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RedisSourceConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default = "default_mode")]
    #[validate(length(min = 1))]
    pub mode: String,
    #[validate(length(min = 1))]
    pub key: String,
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RedisTargetConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default = "default_mode")]
    #[validate(length(min = 1))]
    pub mode: String,
    #[validate(length(min = 1))]
    pub key: String,
}

/// Redis pub/sub and list operations have no per-message application ack
/// or reply channel.
struct RedisAdapter;

#[async_trait]
impl SourceAdapter for RedisAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("redis messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("redis messages carry payload eagerly"))
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

pub struct RedisSource {
    config: RedisSourceConfig,
    cancel: Option<CancellationToken>,
}

impl RedisSource {
    fn new(config: RedisSourceConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for RedisSource {
    fn name(&self) -> &str {
        "redis"
    }
}

#[async_trait]
impl Source for RedisSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let client = redis::Client::open(self.config.url.clone())
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let adapter: Arc<dyn SourceAdapter> = Arc::new(RedisAdapter);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let key = self.config.key.clone();
        if self.config.mode == "list" {
            let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let result: redis::RedisResult<Option<(String, Vec<u8>)>> =
                        conn.blpop(&key, poll_interval.as_secs_f64()).await;
                    match result {
                        Ok(Some((_list, payload))) => {
                            let mut metadata = HashMap::new();
                            metadata.insert("key".to_string(), key.clone());
                            let id = Uuid::new_v4().as_bytes().to_vec();
                            let msg = Message::with_source_data(id, adapter.clone(), metadata, payload);
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(error = %err, "redis blpop error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        } else {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
            pubsub
                .subscribe(&key)
                .await
                .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
            let mut stream = pubsub.into_on_message();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = futures::StreamExt::next(&mut stream) => {
                            let Some(message) = next else { break };
                            let mut metadata = HashMap::new();
                            metadata.insert("channel".to_string(), message.get_channel_name().to_string());
                            let payload: Vec<u8> = match message.get_payload_bytes() {
                                bytes => bytes.to_vec(),
                            };
                            let id = Uuid::new_v4().as_bytes().to_vec();
                            let msg = Message::with_source_data(id, adapter.clone(), metadata, payload);
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

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
    let config: RedisSourceConfig = crate::parse_options("redis", options)?;
    Ok(Box::new(RedisSource::new(config)))
}

/// Connects lazily on first `consume`, since the factory is synchronous.
pub struct RedisTarget {
    config: RedisTargetConfig,
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
}

impl RedisTarget {
    async fn connection(&mut self) -> Result<&mut MultiplexedConnection> {
        if self.conn.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().unwrap())
    }
}

impl Operator for RedisTarget {
    fn name(&self) -> &str {
        "redis"
    }
}

#[async_trait]
impl Target for RedisTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        let key = self.config.key.clone();
        let mode = self.config.mode.clone();
        let conn = self.connection().await?;
        if mode == "list" {
            let _: i64 = conn
                .rpush(&key, data)
                .await
                .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        } else {
            let _: i64 = conn
                .publish(&key, data)
                .await
                .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: RedisTargetConfig = crate::parse_options("redis", options)?;
    let client = redis::Client::open(config.url.clone())?;
    Ok(Box::new(RedisTarget {
        config,
        client,
        conn: None,
    }))
}
