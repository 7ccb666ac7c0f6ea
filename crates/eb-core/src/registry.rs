use std::collections::HashMap;

use serde_json::Value;

use crate::error::{EventBridgeError, Result};
use crate::traits::{Runner, Source, Target};

pub type SourceFactory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Source>> + Send + Sync>;
pub type RunnerFactory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Runner>> + Send + Sync>;
pub type TargetFactory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Target>> + Send + Sync>;

/// Resolves a connector type tag to the factory that builds a
/// Source/Runner/Target instance. This is the compile-time (static)
/// connector-discovery strategy; `eb-connectors::plugin` implements the
/// dynamic-loading strategy on top of the same lookup contract.
#[derive(Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, SourceFactory>,
    runners: HashMap<String, RunnerFactory>,
    targets: HashMap<String, TargetFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, kind: impl Into<String>, factory: SourceFactory) {
        self.sources.insert(kind.into(), factory);
    }

    pub fn register_runner(&mut self, kind: impl Into<String>, factory: RunnerFactory) {
        self.runners.insert(kind.into(), factory);
    }

    pub fn register_target(&mut self, kind: impl Into<String>, factory: TargetFactory) {
        self.targets.insert(kind.into(), factory);
    }

    pub fn build_source(&self, kind: &str, options: Value) -> Result<Box<dyn Source>> {
        let factory = self
            .sources
            .get(kind)
            .ok_or_else(|| EventBridgeError::Config(format!("unknown connector type: {kind}")))?;
        factory(options).map_err(|source| EventBridgeError::ConnectorConstruct {
            connector: kind.to_string(),
            source,
        })
    }

    pub fn build_runner(&self, kind: &str, options: Value) -> Result<Box<dyn Runner>> {
        if kind == "pass" {
            return Ok(Box::new(crate::traits::PassRunner::new("pass")));
        }
        let factory = self
            .runners
            .get(kind)
            .ok_or_else(|| EventBridgeError::Config(format!("unknown connector type: {kind}")))?;
        factory(options).map_err(|source| EventBridgeError::ConnectorConstruct {
            connector: kind.to_string(),
            source,
        })
    }

    pub fn build_target(&self, kind: &str, options: Value) -> Result<Box<dyn Target>> {
        let factory = self
            .targets
            .get(kind)
            .ok_or_else(|| EventBridgeError::Config(format!("unknown connector type: {kind}")))?;
        factory(options).map_err(|source| EventBridgeError::ConnectorConstruct {
            connector: kind.to_string(),
            source,
        })
    }

    pub fn has_source(&self, kind: &str) -> bool {
        self.sources.contains_key(kind)
    }
    pub fn has_runner(&self, kind: &str) -> bool {
        kind == "pass" || self.runners.contains_key(kind)
    }
    pub fn has_target(&self, kind: &str) -> bool {
        self.targets.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_type_is_a_config_error() {
        let registry = ConnectorRegistry::new();
        let err = registry.build_source("nope", Value::Null).unwrap_err();
        assert!(matches!(err, EventBridgeError::Config(msg) if msg.contains("nope")));
    }

    #[test]
    fn pass_runner_type_is_always_available_without_registration() {
        let registry = ConnectorRegistry::new();
        assert!(registry.has_runner("pass"));
        assert!(registry.build_runner("pass", Value::Null).is_ok());
    }

    #[test]
    fn factory_error_is_wrapped_as_connector_construct() {
        let mut registry = ConnectorRegistry::new();
        registry.register_source(
            "broken",
            Box::new(|_| Err(anyhow::anyhow!("boom"))),
        );
        let err = registry.build_source("broken", Value::Null).unwrap_err();
        match err {
            EventBridgeError::ConnectorConstruct { connector, .. } => assert_eq!(connector, "broken"),
            other => panic!("expected ConnectorConstruct, got {other:?}"),
        }
    }
}
