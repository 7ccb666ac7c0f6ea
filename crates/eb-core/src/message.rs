use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{EventBridgeError, Result};

/// The payload+metadata a reply-to-source path writes back through the
/// originating transport.
#[derive(Debug, Clone, Default)]
pub struct ReplyData {
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Monotonic terminal state of a message. Only `Pending -> {Acked, Naked,
/// Replied}` transitions are legal; anything else is a programming error
/// the engine defends against rather than panics on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Pending,
    Acked,
    Naked,
    Replied,
}

/// The source-specific operations a `Message` delegates ack/nak/reply and
/// deferred body materialization to. Implemented once per connector.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch transport-level metadata (headers, topic, partition, ...) for
    /// the message identified by `id`. Some transports have this available
    /// immediately at construction and pre-populate the cache instead.
    async fn fetch_metadata(&self, id: &[u8]) -> anyhow::Result<HashMap<String, String>>;

    /// Fetch the raw payload for the message identified by `id`.
    async fn fetch_payload(&self, id: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Positively acknowledge the message.
    async fn ack(&self, id: &[u8]) -> anyhow::Result<()>;

    /// Negatively acknowledge the message.
    async fn nak(&self, id: &[u8]) -> anyhow::Result<()>;

    /// Reply through the originating transport. Adapters whose transport
    /// has no reply channel (Kafka, NATS core, ...) return `Ok(false)`;
    /// `Ok(true)` means the reply was delivered.
    async fn reply(&self, id: &[u8], reply: ReplyData) -> anyhow::Result<bool>;
}

/// The mutable envelope owned by the pipeline from ingress until exactly one
/// terminal action has been performed on it.
pub struct Message {
    id: Vec<u8>,
    source_metadata: Option<HashMap<String, String>>,
    runner_metadata: HashMap<String, String>,
    source_payload: Option<Vec<u8>>,
    runner_payload: Option<Vec<u8>>,
    reply_slot: Option<ReplyData>,
    terminal: TerminalState,
    adapter: Arc<dyn SourceAdapter>,
}

impl Message {
    /// Construct a message whose source metadata/payload are fetched lazily
    /// on first read (transports that defer body materialization).
    pub fn new(id: Vec<u8>, adapter: Arc<dyn SourceAdapter>) -> Self {
        Self {
            id,
            source_metadata: None,
            runner_metadata: HashMap::new(),
            source_payload: None,
            runner_payload: None,
            reply_slot: None,
            terminal: TerminalState::Pending,
            adapter,
        }
    }

    /// Construct a message whose source metadata/payload are already known
    /// (transports that observe both eagerly, e.g. Kafka headers+value).
    pub fn with_source_data(
        id: Vec<u8>,
        adapter: Arc<dyn SourceAdapter>,
        metadata: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            source_metadata: Some(metadata),
            runner_metadata: HashMap::new(),
            source_payload: Some(payload),
            runner_payload: None,
            reply_slot: None,
            terminal: TerminalState::Pending,
            adapter,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn terminal_state(&self) -> TerminalState {
        self.terminal
    }

    pub async fn source_metadata(&mut self) -> Result<&HashMap<String, String>> {
        if self.source_metadata.is_none() {
            let fetched = self
                .adapter
                .fetch_metadata(&self.id)
                .await
                .map_err(EventBridgeError::SourceProduce)?;
            self.source_metadata = Some(fetched);
        }
        Ok(self.source_metadata.as_ref().unwrap())
    }

    pub async fn source_data(&mut self) -> Result<&[u8]> {
        if self.source_payload.is_none() {
            let fetched = self
                .adapter
                .fetch_payload(&self.id)
                .await
                .map_err(EventBridgeError::SourceProduce)?;
            self.source_payload = Some(fetched);
        }
        Ok(self.source_payload.as_ref().unwrap())
    }

    /// Runner metadata overlaid on source metadata (runner wins on collision).
    pub async fn metadata(&mut self) -> Result<HashMap<String, String>> {
        let mut merged = self.source_metadata().await?.clone();
        merged.extend(self.runner_metadata.clone());
        Ok(merged)
    }

    /// Runner payload if set, else source payload.
    pub async fn data(&mut self) -> Result<&[u8]> {
        if self.runner_payload.is_some() {
            Ok(self.runner_payload.as_ref().unwrap())
        } else {
            self.source_data().await
        }
    }

    pub async fn metadata_and_data(&mut self) -> Result<(HashMap<String, String>, Vec<u8>)> {
        let data = self.data().await?.to_vec();
        let metadata = self.metadata().await?;
        Ok((metadata, data))
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.runner_payload = Some(data);
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.runner_metadata.insert(key.into(), value.into());
    }

    /// Add a key only if absent; existing runner/source values are kept.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.runner_metadata.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn merge_metadata(&mut self, map: HashMap<String, String>) {
        self.runner_metadata.extend(map);
    }

    fn transition(&mut self, next: TerminalState) -> bool {
        if self.terminal != TerminalState::Pending {
            warn!(
                id = ?self.id,
                from = ?self.terminal,
                to = ?next,
                "terminal action invoked on a message that already has one; ignoring"
            );
            return false;
        }
        self.terminal = next;
        true
    }

    pub async fn ack(&mut self) -> Result<()> {
        if !self.transition(TerminalState::Acked) {
            return Ok(());
        }
        self.adapter.ack(&self.id).await.map_err(EventBridgeError::AckNak)
    }

    pub async fn nak(&mut self) -> Result<()> {
        if !self.transition(TerminalState::Naked) {
            return Ok(());
        }
        self.adapter.nak(&self.id).await.map_err(EventBridgeError::AckNak)
    }

    /// Reply through the originating transport with whatever the runner
    /// chain wrote (`runner_payload`/`runner_metadata`, falling back to
    /// source values). Returns `ReplyUnsupported` if the adapter has no
    /// reply channel; the engine treats that as a nak. The terminal state
    /// only moves to `Replied` once the adapter confirms delivery — on
    /// error or `ReplyUnsupported` the message stays `Pending` so a
    /// following `nak()` still reaches the adapter.
    pub async fn reply_source(&mut self) -> Result<()> {
        if self.terminal != TerminalState::Pending {
            warn!(
                id = ?self.id,
                from = ?self.terminal,
                "reply invoked on a message that already has a terminal action; ignoring"
            );
            return Ok(());
        }
        let (metadata, payload) = self.metadata_and_data().await?;
        let delivered = self
            .adapter
            .reply(&self.id, ReplyData { payload, metadata })
            .await
            .map_err(EventBridgeError::AckNak)?;
        if !delivered {
            return Err(EventBridgeError::ReplyUnsupported);
        }
        self.terminal = TerminalState::Replied;
        Ok(())
    }

    /// Directly stash a reply (used by adapters that want to observe what
    /// was written without an actual transport round-trip, e.g. tests).
    pub fn set_reply_slot(&mut self, reply: ReplyData) {
        self.reply_slot = Some(reply);
    }

    pub fn reply_slot(&self) -> Option<&ReplyData> {
        self.reply_slot.as_ref()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("terminal", &self.terminal)
            .field("has_runner_payload", &self.runner_payload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter;

    #[async_trait]
    impl SourceAdapter for NullAdapter {
        async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
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

    /// An adapter whose `reply` always reports unsupported, and which
    /// records whether `nak` was actually invoked on it.
    struct NoReplyAdapter {
        naked: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl SourceAdapter for NoReplyAdapter {
        async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
            self.naked.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn reply(&self, _id: &[u8], _reply: ReplyData) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn metadata_overlay_runner_wins() {
        let adapter: Arc<dyn SourceAdapter> = Arc::new(NullAdapter);
        let mut src_meta = HashMap::new();
        src_meta.insert("topic".to_string(), "orders".to_string());
        src_meta.insert("flag".to_string(), "no".to_string());
        let mut msg = Message::with_source_data(b"1".to_vec(), adapter, src_meta, b"hi".to_vec());
        msg.set_metadata("flag", "yes");
        let merged = msg.metadata().await.unwrap();
        assert_eq!(merged.get("topic").unwrap(), "orders");
        assert_eq!(merged.get("flag").unwrap(), "yes");
    }

    #[tokio::test]
    async fn ack_is_exactly_once() {
        let adapter: Arc<dyn SourceAdapter> = Arc::new(NullAdapter);
        let mut msg = Message::new(b"1".to_vec(), adapter);
        msg.ack().await.unwrap();
        assert_eq!(msg.terminal_state(), TerminalState::Acked);
        // second terminal action is a defensive no-op, not an error
        msg.nak().await.unwrap();
        assert_eq!(msg.terminal_state(), TerminalState::Acked);
    }

    #[tokio::test]
    async fn reply_unsupported_leaves_message_pending_so_a_following_nak_reaches_the_adapter() {
        let naked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let adapter: Arc<dyn SourceAdapter> = Arc::new(NoReplyAdapter { naked: naked.clone() });
        let mut msg = Message::new(b"1".to_vec(), adapter);

        let err = msg.reply_source().await.unwrap_err();
        assert!(matches!(err, EventBridgeError::ReplyUnsupported));
        assert_eq!(msg.terminal_state(), TerminalState::Pending);

        msg.nak().await.unwrap();
        assert_eq!(msg.terminal_state(), TerminalState::Naked);
        assert!(naked.load(std::sync::atomic::Ordering::SeqCst));
    }
}
