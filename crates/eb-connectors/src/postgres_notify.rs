//! PostgreSQL `LISTEN`/`NOTIFY` source built on `tokio_postgres`. The
//! connection's driver future is polled directly as a stream of
//! `AsyncMessage`s; only `Notification` messages become pipeline messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PostgresNotifyConfig {
    #[validate(length(min = 1))]
    pub dsn: String,
    #[validate(length(min = 1))]
    pub channel: String,
}

/// `LISTEN`/`NOTIFY` has no per-message application ack or reply channel.
struct PostgresNotifyAdapter;

#[async_trait]
impl SourceAdapter for PostgresNotifyAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("postgres notify messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("postgres notify messages carry payload eagerly"))
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

pub struct PostgresNotifySource {
    config: PostgresNotifyConfig,
    cancel: Option<CancellationToken>,
}

impl PostgresNotifySource {
    fn new(config: PostgresNotifyConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for PostgresNotifySource {
    fn name(&self) -> &str {
        "postgres_notify"
    }
}

#[async_trait]
impl Source for PostgresNotifySource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let (client, mut connection) = tokio_postgres::connect(&self.config.dsn, NoTls)
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
        client
            .batch_execute(&format!("LISTEN \"{}\"", self.config.channel))
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let adapter: Arc<dyn SourceAdapter> = Arc::new(PostgresNotifyAdapter);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            let _client = client;
            // `Connection` implements `Future`/`poll_message`, not `Stream`;
            // `poll_fn` adapts it into one so it can be driven alongside the
            // cancellation future inside `select!`.
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = messages.next() => {
                        match next {
                            Some(Ok(AsyncMessage::Notification(notification))) => {
                                let mut metadata = HashMap::new();
                                metadata.insert("channel".to_string(), notification.channel().to_string());
                                metadata.insert("pid".to_string(), notification.process_id().to_string());
                                let payload = notification.payload().as_bytes().to_vec();
                                let id = Uuid::new_v4().as_bytes().to_vec();
                                let msg = Message::with_source_data(id, adapter.clone(), metadata, payload);
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(error = %err, "postgres connection error");
                                break;
                            }
                            None => break,
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
    let config: PostgresNotifyConfig = crate::parse_options("postgres_notify", options)?;
    Ok(Box::new(PostgresNotifySource::new(config)))
}
