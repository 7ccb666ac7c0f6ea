//! CoAP connector: UDP request/response with the same ack-rendezvous shape
//! as the HTTP connector, scaled down to CoAP's response codes (no content
//! negotiation, no block-wise transfer).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::{MessageClass, MessageType, Packet, RequestType, ResponseType};
use eb_core::{
    EventBridgeError, Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter,
    Target,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CoapSourceConfig {
    #[validate(length(min = 1))]
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CoapTargetConfig {
    #[validate(length(min = 1))]
    pub target_addr: String,
}

struct PendingRequest {
    peer: SocketAddr,
    request_packet: Packet,
}

/// Tracks one pending datagram per in-flight request so `ack`/`nak`/`reply`
/// can send a CoAP response back to the original peer with a matching
/// message id and token.
struct CoapAdapter {
    socket: Arc<UdpSocket>,
    pending: Mutex<HashMap<Vec<u8>, PendingRequest>>,
}

impl CoapAdapter {
    async fn respond(&self, id: &[u8], code: MessageClass, payload: Vec<u8>) -> anyhow::Result<()> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| anyhow::anyhow!("no pending CoAP request for this message id"))?;
        let mut response = Packet::new();
        response.header.set_version(1);
        response.header.set_type(MessageType::Acknowledgement);
        response.header.code = code;
        response.header.message_id = pending.request_packet.header.message_id;
        response.set_token(pending.request_packet.get_token().to_vec());
        response.payload = payload;
        let bytes = response
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("coap encode error: {e:?}"))?;
        self.socket.send_to(&bytes, pending.peer).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for CoapAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("coap messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("coap messages carry payload eagerly"))
    }
    async fn ack(&self, id: &[u8]) -> anyhow::Result<()> {
        self.respond(id, MessageClass::Response(ResponseType::Changed), Vec::new())
            .await
    }
    async fn nak(&self, id: &[u8]) -> anyhow::Result<()> {
        self.respond(
            id,
            MessageClass::Response(ResponseType::InternalServerError),
            Vec::new(),
        )
        .await
    }
    async fn reply(&self, id: &[u8], reply: ReplyData) -> anyhow::Result<bool> {
        self.respond(id, MessageClass::Response(ResponseType::Content), reply.payload)
            .await?;
        Ok(true)
    }
}

pub struct CoapSource {
    config: CoapSourceConfig,
    cancel: Option<CancellationToken>,
}

impl CoapSource {
    fn new(config: CoapSourceConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for CoapSource {
    fn name(&self) -> &str {
        "coap"
    }
}

#[async_trait]
impl Source for CoapSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let socket = UdpSocket::bind(&self.config.listen_addr)
            .await
            .map_err(|e| EventBridgeError::SourceProduce(anyhow::anyhow!(e)))?;
        let socket = Arc::new(socket);
        let adapter = Arc::new(CoapAdapter {
            socket: socket.clone(),
            pending: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => {
                        let (n, peer) = match result {
                            Ok(v) => v,
                            Err(err) => { warn!(error = %err, "coap recv error"); continue; }
                        };
                        let packet = match Packet::from_bytes(&buf[..n]) {
                            Ok(p) => p,
                            Err(err) => { warn!(error = ?err, "coap decode error"); continue; }
                        };
                        let mut metadata = HashMap::new();
                        for (number, values) in packet.options() {
                            for (i, value) in values.iter().enumerate() {
                                metadata.insert(
                                    format!("option-{number:?}-{i}"),
                                    String::from_utf8_lossy(value).into_owned(),
                                );
                            }
                        }
                        let payload = packet.payload.clone();
                        let id = Uuid::new_v4().as_bytes().to_vec();
                        adapter.pending.lock().await.insert(
                            id.clone(),
                            PendingRequest { peer, request_packet: packet },
                        );
                        let adapter_dyn: Arc<dyn SourceAdapter> = adapter.clone();
                        let msg = Message::with_source_data(id, adapter_dyn, metadata, payload);
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
    let config: CoapSourceConfig = crate::parse_options("coap", options)?;
    Ok(Box::new(CoapSource::new(config)))
}

/// Fire-and-forget CoAP client: sends one confirmable POST per message
/// without waiting for the peer's acknowledgement, since the target side
/// has no further terminal action to perform on it.
pub struct CoapTarget {
    socket: UdpSocket,
    target_addr: SocketAddr,
    next_message_id: u16,
}

impl Operator for CoapTarget {
    fn name(&self) -> &str {
        "coap"
    }
}

#[async_trait]
impl Target for CoapTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        let mut packet = Packet::new();
        packet.header.set_version(1);
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        packet.payload = data;

        let bytes = packet
            .to_bytes()
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!("coap encode error: {e:?}")))?;
        self.socket
            .send_to(&bytes, self.target_addr)
            .await
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: CoapTargetConfig = crate::parse_options("coap", options)?;
    let target_addr: SocketAddr = config
        .target_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid target_addr: {e}"))?;
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    Ok(Box::new(CoapTarget {
        socket,
        target_addr,
        next_message_id: 0,
    }))
}
