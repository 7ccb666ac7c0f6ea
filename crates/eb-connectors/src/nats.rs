//! NATS connector built on `async-nats`. Source subscribes to a subject;
//! target publishes; reply-to-source uses the inbox subject NATS attaches
//! to request-reply publishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_nats::{Client, Subject};
use async_trait::async_trait;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NatsSourceConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(length(min = 1))]
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NatsTargetConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(length(min = 1))]
    pub subject: String,
}

/// NATS core pub/sub has no application ack; `ack`/`nak` are no-ops. Reply
/// publishes to the inbox subject the requester attached, when present.
struct NatsAdapter {
    client: Client,
    reply_subjects: Mutex<HashMap<Vec<u8>, Subject>>,
}

#[async_trait]
impl SourceAdapter for NatsAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("nats messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("nats messages carry payload eagerly"))
    }
    async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reply(&self, id: &[u8], reply: ReplyData) -> anyhow::Result<bool> {
        let subject = self.reply_subjects.lock().await.remove(id);
        match subject {
            Some(subject) => {
                self.client.publish(subject, reply.payload.into()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct NatsSource {
    config: NatsSourceConfig,
    cancel: Option<CancellationToken>,
}

impl NatsSource {
    fn new(config: NatsSourceConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for NatsSource {
    fn name(&self) -> &str {
        "nats"
    }
}

#[async_trait]
impl Source for NatsSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let client = async_nats::connect(&self.config.url)
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
        let mut subscriber = client
            .subscribe(self.config.subject.clone())
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let adapter = Arc::new(NatsAdapter {
            client,
            reply_subjects: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscriber.next() => {
                        let Some(message) = next else { break };
                        let id = Uuid::new_v4().as_bytes().to_vec();
                        let mut metadata = HashMap::new();
                        metadata.insert("subject".to_string(), message.subject.to_string());
                        if let Some(reply) = message.reply.clone() {
                            adapter.reply_subjects.lock().await.insert(id.clone(), reply);
                        }
                        let adapter_dyn: Arc<dyn SourceAdapter> = adapter.clone();
                        let msg = Message::with_source_data(id, adapter_dyn, metadata, message.payload.to_vec());
                        if tx.send(msg).await.is_err() {
                            break;
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
    let config: NatsSourceConfig = crate::parse_options("nats", options)?;
    Ok(Box::new(NatsSource::new(config)))
}

/// Connects lazily on first `consume`, since connector factories are
/// synchronous and establishing a NATS connection is not.
pub struct NatsTarget {
    config: NatsTargetConfig,
    client: Option<Client>,
}

impl NatsTarget {
    async fn client(&mut self) -> Result<&Client> {
        if self.client.is_none() {
            let client = async_nats::connect(&self.config.url)
                .await
                .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
            self.client = Some(client);
        }
        Ok(self.client.as_ref().unwrap())
    }
}

impl Operator for NatsTarget {
    fn name(&self) -> &str {
        "nats"
    }
}

#[async_trait]
impl Target for NatsTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        let subject = self.config.subject.clone();
        let client = self.client().await?;
        client
            .publish(subject, data.into())
            .await
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: NatsTargetConfig = crate::parse_options("nats", options)?;
    Ok(Box::new(NatsTarget {
        config,
        client: None,
    }))
}
