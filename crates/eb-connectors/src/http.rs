//! HTTP connector: `axum` webhook source with an ack-rendezvous (the
//! request is only answered once the pipeline terminates the message),
//! `reqwest` POST target.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::routing::post;
use axum::Router;
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct HttpSourceConfig {
    #[validate(length(min = 1))]
    pub listen_addr: String,
    #[serde(default = "default_path")]
    #[validate(length(min = 1))]
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Validate)]
pub struct HttpTargetConfig {
    #[validate(url)]
    pub url: String,
    #[serde(default = "default_method")]
    #[validate(length(min = 1))]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

enum RendezvousOutcome {
    Ack,
    Nak,
    Reply(ReplyData),
}

/// Holds one pending oneshot per in-flight request, keyed by message id, so
/// `ack`/`nak`/`reply` can answer the HTTP request that originated it.
struct HttpAdapter {
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<RendezvousOutcome>>>,
}

impl HttpAdapter {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, id: Vec<u8>, tx: oneshot::Sender<RendezvousOutcome>) {
        self.pending.lock().await.insert(id, tx);
    }

    async fn resolve(&self, id: &[u8], outcome: RendezvousOutcome) -> anyhow::Result<()> {
        let sender = self.pending.lock().await.remove(id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(anyhow::anyhow!("no pending HTTP request for this message id")),
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!(
            "http messages carry their metadata eagerly; lazy fetch should never be reached"
        ))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!(
            "http messages carry their payload eagerly; lazy fetch should never be reached"
        ))
    }
    async fn ack(&self, id: &[u8]) -> anyhow::Result<()> {
        self.resolve(id, RendezvousOutcome::Ack).await
    }
    async fn nak(&self, id: &[u8]) -> anyhow::Result<()> {
        self.resolve(id, RendezvousOutcome::Nak).await
    }
    async fn reply(&self, id: &[u8], reply: ReplyData) -> anyhow::Result<bool> {
        self.resolve(id, RendezvousOutcome::Reply(reply)).await?;
        Ok(true)
    }
}

#[derive(Clone)]
struct HttpState {
    adapter: Arc<HttpAdapter>,
    tx: mpsc::Sender<Message>,
    timeout: Duration,
}

async fn handle(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, HeaderMap, Bytes) {
    let id = Uuid::new_v4().as_bytes().to_vec();
    let mut metadata = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            metadata.insert(name.to_string(), v.to_string());
        }
    }

    let (done_tx, done_rx) = oneshot::channel();
    state.adapter.register(id.clone(), done_tx).await;

    let adapter: Arc<dyn SourceAdapter> = state.adapter.clone();
    let msg = Message::with_source_data(id.clone(), adapter, metadata, body.to_vec());
    if state.tx.send(msg).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), Bytes::new());
    }

    match tokio::time::timeout(state.timeout, done_rx).await {
        Ok(Ok(RendezvousOutcome::Ack)) => (StatusCode::OK, HeaderMap::new(), Bytes::new()),
        Ok(Ok(RendezvousOutcome::Nak)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Bytes::new())
        }
        Ok(Ok(RendezvousOutcome::Reply(reply))) => {
            let mut out_headers = HeaderMap::new();
            for (k, v) in reply.metadata {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(k),
                    HeaderValue::try_from(v),
                ) {
                    out_headers.insert(name, value);
                }
            }
            (StatusCode::OK, out_headers, Bytes::from(reply.payload))
        }
        Ok(Err(_)) => (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Bytes::new()),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, HeaderMap::new(), Bytes::new()),
    }
}

pub struct HttpSource {
    config: HttpSourceConfig,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HttpSource {
    fn new(config: HttpSourceConfig) -> Self {
        Self {
            config,
            shutdown: None,
        }
    }
}

impl Operator for HttpSource {
    fn name(&self) -> &str {
        "http"
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let (tx, rx) = mpsc::channel(buffer);
        let adapter = Arc::new(HttpAdapter::new());
        let state = HttpState {
            adapter,
            tx,
            timeout: Duration::from_millis(self.config.timeout_ms),
        };
        let app = Router::new()
            .route(&self.config.path, post(handle))
            .with_state(state);

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!("invalid listen_addr: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "http source server exited with error");
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

pub fn build_source(options: Value) -> anyhow::Result<Box<dyn Source>> {
    let config: HttpSourceConfig = crate::parse_options("http", options)?;
    Ok(Box::new(HttpSource::new(config)))
}

pub struct HttpTarget {
    client: reqwest::Client,
    config: HttpTargetConfig,
}

impl Operator for HttpTarget {
    fn name(&self) -> &str {
        "http"
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let (metadata, data) = msg.metadata_and_data().await?;
        let method = reqwest::Method::from_bytes(self.config.method.as_bytes())
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        let mut req = self.client.request(method, &self.config.url).body(data);
        for (k, v) in metadata {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        if !resp.status().is_success() {
            return Err(EventBridgeError::TargetConsume(anyhow::anyhow!(
                "http target responded with {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: HttpTargetConfig = crate::parse_options("http", options)?;
    Ok(Box::new(HttpTarget {
        client: reqwest::Client::new(),
        config,
    }))
}
