use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative source configuration: connector type tag, ingress buffer
/// capacity, and opaque connector-specific options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    #[serde(default)]
    pub options: Value,
}

/// Declarative runner configuration: connector type tag, parallelism, the
/// two predicate strings, and opaque connector-specific options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_routines")]
    pub routines: i64,
    #[serde(default, rename = "ifExpr")]
    pub if_expr: Option<String>,
    #[serde(default, rename = "filterExpr")]
    pub filter_expr: Option<String>,
    #[serde(default)]
    pub options: Value,
}

/// Declarative target configuration. `type = "none"` (or an absent target
/// section) selects reply-to-source mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_routines")]
    pub routines: i64,
    #[serde(default)]
    pub options: Value,
}

impl TargetConfig {
    pub fn is_none(&self) -> bool {
        self.kind.is_empty() || self.kind == "none"
    }
}

/// Top-level configuration document: source, ordered runners, optional
/// target, and an auxiliary services array that is out of core scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub services: Vec<Value>,
}

fn default_buffer() -> usize {
    64
}

/// `max(1, cfg.routines)`, normalizing every
/// `Routines = 0` (or negative) configuration to "at least 1".
pub fn clamp_routines(routines: i64) -> usize {
    routines.max(1) as usize
}

fn default_routines() -> i64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_routines_normalizes_zero_and_negative_to_one() {
        assert_eq!(clamp_routines(0), 1);
        assert_eq!(clamp_routines(-5), 1);
        assert_eq!(clamp_routines(4), 4);
    }

    #[test]
    fn target_config_absent_type_means_reply_to_source() {
        let cfg: TargetConfig = serde_json::from_value(serde_json::json!({ "type": "none" })).unwrap();
        assert!(cfg.is_none());
        let cfg: TargetConfig = serde_json::from_value(serde_json::json!({ "type": "kafka" })).unwrap();
        assert!(!cfg.is_none());
    }

    #[test]
    fn runner_config_defaults_routines_to_one_and_predicates_to_none() {
        let cfg: RunnerConfig = serde_json::from_value(serde_json::json!({ "type": "pass" })).unwrap();
        assert_eq!(cfg.routines, 1);
        assert!(cfg.if_expr.is_none());
        assert!(cfg.filter_expr.is_none());
    }
}
