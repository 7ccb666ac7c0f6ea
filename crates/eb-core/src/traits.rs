use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::message::Message;

/// A finite or infinite stream of messages produced by a `Source`.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Base trait for all pipeline operators: name used for logging and pipeline
/// graph construction.
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;
}

/// Entry point of a pipeline. `produce` starts whatever the source needs
/// (listeners, subscriptions, polling) and returns a stream bounded by
/// `buffer`. The stream is closed only when the source itself terminates
/// the upstream; `close` stops production and releases resources.
#[async_trait]
pub trait Source: Operator {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream>;
    async fn close(&mut self) -> Result<()>;
}

/// A processing stage. `process` mutates the message in place (typically
/// `set_data`/`set_metadata`) or reports an error, which the engine turns
/// into a nak.
#[async_trait]
pub trait Runner: Operator {
    async fn process(&mut self, msg: &mut Message) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Exit point of a pipeline. `consume` performs the external-side effect;
/// it does not ack/nak, the engine does.
#[async_trait]
pub trait Target: Operator {
    async fn consume(&mut self, msg: &mut Message) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// The built-in no-op runner: instantiating no runner, the
/// slot exists only for its `ifExpr`/`filterExpr` predicates.
pub struct PassRunner {
    name: String,
}

impl PassRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Operator for PassRunner {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Runner for PassRunner {
    async fn process(&mut self, _msg: &mut Message) -> Result<()> {
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
