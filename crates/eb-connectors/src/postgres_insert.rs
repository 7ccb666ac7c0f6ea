//! PostgreSQL insert target built on `tokio_postgres`. Executes a
//! configured parameterized statement, filling `$1..$n` from either the
//! message payload or a named metadata field. Connects lazily on first
//! `consume`, since the factory is synchronous.

use eb_core::{EventBridgeError, Message, Operator, Result, Target};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_postgres::{types::ToSql, Client, NoTls};
use tracing::warn;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PostgresInsertConfig {
    #[validate(length(min = 1))]
    pub dsn: String,
    #[validate(length(min = 1))]
    pub statement: String,
    #[serde(default = "default_params")]
    #[validate(length(min = 1))]
    pub params: Vec<String>,
}

fn default_params() -> Vec<String> {
    vec!["data".to_string()]
}

enum ParamSource {
    Data,
    Metadata(String),
}

fn parse_param_source(raw: &str) -> ParamSource {
    match raw.strip_prefix("metadata.") {
        Some(key) => ParamSource::Metadata(key.to_string()),
        None => ParamSource::Data,
    }
}

pub struct PostgresInsertTarget {
    config: PostgresInsertConfig,
    client: Option<Client>,
}

impl PostgresInsertTarget {
    async fn client(&mut self) -> Result<&Client> {
        if self.client.is_none() {
            let (client, connection) = tokio_postgres::connect(&self.config.dsn, NoTls)
                .await
                .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    warn!(error = %err, "postgres insert connection error");
                }
            });
            self.client = Some(client);
        }
        Ok(self.client.as_ref().unwrap())
    }
}

impl Operator for PostgresInsertTarget {
    fn name(&self) -> &str {
        "postgres_insert"
    }
}

#[async_trait]
impl Target for PostgresInsertTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        let (metadata, data) = msg.metadata_and_data().await?;
        let sources: Vec<ParamSource> = self.config.params.iter().map(|p| parse_param_source(p)).collect();

        let mut text_values: Vec<String> = Vec::with_capacity(sources.len());
        let mut is_bytes: Vec<bool> = Vec::with_capacity(sources.len());
        for source in &sources {
            match source {
                ParamSource::Data => {
                    is_bytes.push(true);
                    text_values.push(String::new());
                }
                ParamSource::Metadata(key) => {
                    is_bytes.push(false);
                    text_values.push(metadata.get(key).cloned().unwrap_or_default());
                }
            }
        }

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(sources.len());
        for (i, bytes) in is_bytes.iter().enumerate() {
            if *bytes {
                params.push(&data);
            } else {
                params.push(&text_values[i]);
            }
        }

        let statement = self.config.statement.clone();
        let client = self.client().await?;
        client
            .execute(statement.as_str(), &params)
            .await
            .map_err(|e| EventBridgeError::TargetConsume(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_target(options: Value) -> anyhow::Result<Box<dyn Target>> {
    let config: PostgresInsertConfig = crate::parse_options("postgres_insert", options)?;
    Ok(Box::new(PostgresInsertTarget {
        config,
        client: None,
    }))
}
