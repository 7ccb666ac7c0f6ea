//! # eventbridge — CLI bootstrap
//!
//! Loads a `BridgeConfig` (file, inline content, or environment overlay),
//! builds the connector registry, spawns the pipeline, and waits for
//! either natural completion or a shutdown signal.
//!
//! ## Usage
//!
//! ```bash
//! eventbridge --config-file-path config.yaml
//! EB_SOURCE__BUFFER=256 eventbridge --config-file-path config.yaml
//! eventbridge --config-content '{"source":{"type":"http","options":{...}}}' --config-format json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use eb_core::{BridgeConfig, ConnectorRegistry};
use eb_engine::Bridge;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/etc/events-bridge/config.yaml";

/// Raised when a config file extension or `--config-format` value isn't one
/// of the supported `yaml`/`yml`/`json` forms (spec: `UnsupportedExtensionError`).
#[derive(Debug, Error)]
#[error("unsupported config extension/format: {0}")]
struct UnsupportedExtensionError(String);

/// Command-line arguments for the event bridge runner.
#[derive(Parser, Debug)]
#[command(name = "eventbridge")]
#[command(about = "Configurable event bridge: source -> runner chain -> target/reply")]
struct Args {
    /// Path to the bridge configuration file (YAML or JSON).
    ///
    /// Falls back to `/etc/events-bridge/config.yaml` when omitted. Values
    /// are overlaid by `EB_`-prefixed environment variables (double
    /// underscore as the nesting separator, e.g. `EB_SOURCE__BUFFER=256`).
    #[arg(long)]
    config_file_path: Option<PathBuf>,

    /// Inline configuration content, used instead of a file.
    #[arg(long, conflicts_with = "config_file_path")]
    config_content: Option<String>,

    /// Format of `--config-content`. Defaults to sniffing the trimmed
    /// content: a leading `{` means JSON, anything else means YAML.
    #[arg(long)]
    config_format: Option<String>,
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    if let Some(content) = &args.config_content {
        let format = args
            .config_format
            .clone()
            .unwrap_or_else(|| sniff_content_format(content).to_string());
        return match format.as_str() {
            "json" => serde_json::from_str(content).context("parsing --config-content as JSON"),
            "yaml" | "yml" => serde_yaml::from_str(content).context("parsing --config-content as YAML"),
            other => Err(UnsupportedExtensionError(other.to_string()).into()),
        };
    }

    let path = args
        .config_file_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") | Some("json") => {}
        other => {
            return Err(UnsupportedExtensionError(format!("{:?}", other)).into());
        }
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(path.clone()).required(args.config_file_path.is_some()))
        .add_source(config::Environment::with_prefix("EB").separator("__"))
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    settings
        .try_deserialize::<BridgeConfig>()
        .context("deserializing bridge configuration")
}

/// A trimmed content starting with `{` is treated as JSON; everything else
/// is treated as YAML (a superset that also accepts plain JSON, but the
/// explicit check keeps the common case unambiguous).
fn sniff_content_format(content: &str) -> &'static str {
    if content.trim_start().starts_with('{') {
        "json"
    } else {
        "yaml"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut registry = ConnectorRegistry::new();
    eb_connectors::register_builtins(&mut registry);

    let bridge = Bridge::build(config, &registry).context("building pipeline from configuration")?;
    let cancel = CancellationToken::new();
    let mut running = bridge.spawn(cancel.clone()).await.context("starting pipeline")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            cancel.cancel();
            running.join().await;
        }
        _ = terminate_signal() => {
            tracing::info!("received SIGTERM, shutting down");
            cancel.cancel();
            running.join().await;
        }
        _ = running.join() => {
            tracing::info!("pipeline drained, shutting down");
        }
    }

    // Shutdown-path errors are logged, not exit-coded (spec: only startup
    // errors affect the process exit code).
    if let Err(err) = running.close().await {
        tracing::error!(error = %err, "pipeline shutdown reported errors");
    }
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending().await
}
