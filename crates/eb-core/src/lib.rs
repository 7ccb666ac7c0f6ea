//! # eb-core — message, connector contract, and config types
//!
//! This crate provides the foundational types and traits shared across the
//! events-bridge engine: the `Message` envelope with its ack/nak/reply
//! lifecycle, the `Source`/`Runner`/`Target` connector contract, the
//! declarative config records (`SourceConfig`/`RunnerConfig`/`TargetConfig`),
//! and the connector registry that resolves a type tag to a factory.
//!
//! Connector bodies (Kafka write logic, TLS, SQL, ...) are not part of this
//! crate — see `eb-connectors`. The engine that wires these pieces into a
//! running pipeline is `eb-engine`.

pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod traits;

pub use config::{clamp_routines, BridgeConfig, RunnerConfig, SourceConfig, TargetConfig};
pub use error::{EventBridgeError, Result};
pub use message::{Message, ReplyData, SourceAdapter, TerminalState};
pub use registry::{ConnectorRegistry, RunnerFactory, SourceFactory, TargetFactory};
pub use traits::{MessageStream, Operator, PassRunner, Runner, Source, Target};

/// A `RunnerConfig` paired with its constructed `Runner` instance; the
/// engine holds a sequence of these in declaration order.
pub struct RunnerItem {
    pub config: RunnerConfig,
    pub runner: Box<dyn Runner>,
}

impl RunnerItem {
    pub fn new(config: RunnerConfig, runner: Box<dyn Runner>) -> Self {
        Self { config, runner }
    }
}
