//! CLI subprocess runner: pipes the current payload to a configured
//! command's stdin and replaces the payload with its stdout. A non-zero
//! exit status surfaces as a runner-process error.

use async_trait::async_trait;
use eb_core::{EventBridgeError, Message, Operator, Result, Runner};
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use validator::Validate;

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CliRunnerConfig {
    #[validate(length(min = 1))]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

pub struct CliRunner {
    config: CliRunnerConfig,
}

impl CliRunner {
    fn new(config: CliRunnerConfig) -> Self {
        Self { config }
    }
}

impl Operator for CliRunner {
    fn name(&self) -> &str {
        "cli"
    }
}

#[async_trait]
impl Runner for CliRunner {
    async fn process(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EventBridgeError::RunnerProcess(anyhow::anyhow!(e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EventBridgeError::RunnerProcess(anyhow::anyhow!("failed to open child stdin")))?;
        stdin
            .write_all(&data)
            .await
            .map_err(|e| EventBridgeError::RunnerProcess(anyhow::anyhow!(e)))?;
        drop(stdin);

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| EventBridgeError::RunnerProcess(anyhow::anyhow!("cli runner timed out")))?
            .map_err(|e| EventBridgeError::RunnerProcess(anyhow::anyhow!(e)))?;

        if !output.status.success() {
            return Err(EventBridgeError::RunnerProcess(anyhow::anyhow!(
                "cli runner exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        msg.set_data(output.stdout);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_runner(options: Value) -> anyhow::Result<Box<dyn Runner>> {
    let config: CliRunnerConfig = crate::parse_options("cli", options)?;
    Ok(Box::new(CliRunner::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uppercases_via_tr_and_replaces_payload() {
        let mut runner = CliRunner::new(CliRunnerConfig {
            command: "tr".to_string(),
            args: vec!["a-z".to_string(), "A-Z".to_string()],
            timeout_ms: 5_000,
        });

        let adapter: std::sync::Arc<dyn eb_core::SourceAdapter> = std::sync::Arc::new(NullAdapter);
        let mut msg = Message::with_source_data(b"1".to_vec(), adapter, Default::default(), b"hello".to_vec());
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.data().await.unwrap(), b"HELLO");
    }

    #[test]
    fn empty_command_is_rejected_by_validation() {
        let err = build_runner(serde_json::json!({ "command": "" })).unwrap_err();
        assert!(err.to_string().contains("invalid options"));
    }

    #[test]
    fn runner_name_is_cli() {
        let runner = CliRunner::new(CliRunnerConfig {
            command: "true".to_string(),
            args: vec![],
            timeout_ms: 1_000,
        });
        assert_eq!(runner.name(), "cli");
    }

    struct NullAdapter;

    #[async_trait]
    impl eb_core::SourceAdapter for NullAdapter {
        async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<std::collections::HashMap<String, String>> {
            Ok(Default::default())
        }
        async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reply(&self, _id: &[u8], _reply: eb_core::ReplyData) -> anyhow::Result<bool> {
            Ok(false)
        }
    }
}
