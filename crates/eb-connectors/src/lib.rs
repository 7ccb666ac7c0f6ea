//! # eb-connectors — built-in source/runner/target connectors
//!
//! Each module implements one transport named in the connector breadth list:
//! a thin, real-crate-backed adapter depth-matched to "specified only by the
//! interface it exposes". `register_builtins` wires every one of them into a
//! `ConnectorRegistry` under its `type` tag.

pub mod cli;
pub mod git_poll;
pub mod http;
pub mod kafka;
pub mod mqtt;
pub mod nats;
pub mod plugin;
pub mod postgres_insert;
pub mod postgres_notify;
pub mod redis;
pub mod udp_coap;

use eb_core::ConnectorRegistry;
use serde::de::DeserializeOwned;
use serde_json::Value;
use validator::Validate;

/// Deserialize a connector's `options` object into its typed config and run
/// its `validator` checks, wrapping either failure with the connector kind
/// for a useful message. A failure here becomes `ConnectorConstructError`
/// once the caller's factory returns it.
pub(crate) fn parse_options<T: DeserializeOwned + Validate>(kind: &str, options: Value) -> anyhow::Result<T> {
    let config: T = serde_json::from_value(options)
        .map_err(|e| anyhow::anyhow!("{kind}: invalid options: {e}"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{kind}: invalid options: {e}"))?;
    Ok(config)
}

/// Register every built-in connector under its `type` tag. `pass` is
/// special-cased directly in `ConnectorRegistry::build_runner` and needs no
/// entry here.
pub fn register_builtins(registry: &mut ConnectorRegistry) {
    registry.register_source("http", Box::new(http::build_source));
    registry.register_target("http", Box::new(http::build_target));

    registry.register_source("coap", Box::new(udp_coap::build_source));
    registry.register_target("coap", Box::new(udp_coap::build_target));

    registry.register_source("mqtt", Box::new(mqtt::build_source));
    registry.register_target("mqtt", Box::new(mqtt::build_target));

    registry.register_source("nats", Box::new(nats::build_source));
    registry.register_target("nats", Box::new(nats::build_target));

    registry.register_source("kafka", Box::new(kafka::build_source));
    registry.register_target("kafka", Box::new(kafka::build_target));

    registry.register_source("redis", Box::new(redis::build_source));
    registry.register_target("redis", Box::new(redis::build_target));

    registry.register_source("postgres_notify", Box::new(postgres_notify::build_source));
    registry.register_target("postgres_insert", Box::new(postgres_insert::build_target));

    registry.register_source("git_poll", Box::new(git_poll::build_source));

    registry.register_runner("cli", Box::new(cli::build_runner));

    registry.register_runner("plugin", Box::new(plugin::build_runner));
}
