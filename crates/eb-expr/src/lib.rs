//! # eb-expr — predicate expression evaluator
//!
//! Backs the opaque expression-evaluator collaborator used as a predicate gate:
//! compiles `ifExpr`/`filterExpr` strings once and evaluates them against a
//! `{ metadata, data }` binding, coercing the result to a boolean via a fixed
//! coercion table. Built on `evalexpr`, which has no member-access operator
//! or sandboxing of its own, both of which are added here.

use std::collections::HashMap;

use eb_core::EventBridgeError;
use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, Function, HashMapContext, Node,
    Value,
};
use tracing::warn;

/// A compiled `ifExpr`/`filterExpr`, or the implicit "always true" predicate
/// for an empty expression string.
pub enum Predicate {
    Always,
    Compiled { source: String, node: Node },
}

/// The runtime binding an expression is evaluated against: current metadata
/// overlay and current payload.
pub struct EvalBinding<'a> {
    pub metadata: &'a HashMap<String, String>,
    pub data: &'a [u8],
}

/// Guardrails enforced at compile time since `evalexpr` has no sandbox.
pub struct PredicateLimits {
    pub max_len: usize,
    pub max_complexity: usize,
    pub max_paren_depth: usize,
    pub allowed_functions: Vec<&'static str>,
}

impl Default for PredicateLimits {
    fn default() -> Self {
        Self {
            max_len: 1024,
            max_complexity: 256,
            max_paren_depth: 32,
            allowed_functions: vec!["metadata", "data", "len", "min", "max", "if", "contains"],
        }
    }
}

/// Compile `expr` (an empty/`None` string means "always true").
///
/// Runs the validation helpers first; a limit violation or
/// a genuine parse failure both surface as `PredicateCompileError`, which
/// the engine logs and treats as "skip this runner".
pub fn compile(expr: Option<&str>) -> Result<Predicate, EventBridgeError> {
    let expr = match expr {
        Some(e) if !e.trim().is_empty() => e,
        _ => return Ok(Predicate::Always),
    };
    validate(expr, &PredicateLimits::default())?;
    let node = evalexpr::build_operator_tree(expr)
        .map_err(|e| EventBridgeError::PredicateCompile(format!("{expr}: {e}")))?;
    Ok(Predicate::Compiled {
        source: expr.to_string(),
        node,
    })
}

fn validate(expr: &str, limits: &PredicateLimits) -> Result<(), EventBridgeError> {
    if expr.len() > limits.max_len {
        return Err(EventBridgeError::PredicateCompile(format!(
            "expression exceeds max length of {} chars",
            limits.max_len
        )));
    }

    let mut depth: i64 = 0;
    let mut max_depth: i64 = 0;
    for c in expr.chars() {
        match c {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => depth -= 1,
            _ => {}
        }
    }
    if depth != 0 {
        return Err(EventBridgeError::PredicateCompile(
            "unbalanced parentheses".to_string(),
        ));
    }
    if max_depth as usize > limits.max_paren_depth {
        return Err(EventBridgeError::PredicateCompile(format!(
            "expression nests parentheses deeper than {}",
            limits.max_paren_depth
        )));
    }

    let node = evalexpr::build_operator_tree(expr)
        .map_err(|e| EventBridgeError::PredicateCompile(format!("{expr}: {e}")))?;

    let complexity = node.iter().count();
    if complexity > limits.max_complexity {
        return Err(EventBridgeError::PredicateCompile(format!(
            "expression complexity {complexity} exceeds limit {}",
            limits.max_complexity
        )));
    }

    for func in node.iter_function_identifiers() {
        if !limits.allowed_functions.contains(&func) {
            return Err(EventBridgeError::PredicateCompile(format!(
                "function `{func}` is not in the allowlist"
            )));
        }
    }

    Ok(())
}

impl Predicate {
    /// Evaluate against `binding`, coercing the result to a boolean per
    /// this table: nil -> false; booleans pass through; numeric zero ->
    /// false else true; empty string -> false, "0"/"false" -> false, other
    /// strings -> true; empty tuple -> false, non-empty -> true.
    pub fn eval(&self, binding: &EvalBinding<'_>) -> Result<bool, EventBridgeError> {
        let node = match self {
            Predicate::Always => return Ok(true),
            Predicate::Compiled { node, .. } => node,
        };

        let context = build_context(binding);
        let value = node
            .eval_with_context(&context)
            .map_err(|e| EventBridgeError::PredicateEval(format!("{e}")))?;
        Ok(coerce_bool(&value))
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Predicate::Always => None,
            Predicate::Compiled { source, .. } => Some(source),
        }
    }
}

fn build_context(binding: &EvalBinding<'_>) -> HashMapContext {
    let mut ctx = HashMapContext::new();

    let metadata = binding.metadata.clone();
    let _ = ctx.set_function(
        "metadata".to_string(),
        Function::new(move |arg| {
            let key = arg.as_string()?;
            Ok(Value::String(metadata.get(&key).cloned().unwrap_or_default()))
        }),
    );

    let data_string = String::from_utf8_lossy(binding.data).into_owned();
    let _ = ctx.set_function(
        "data".to_string(),
        Function::new(move |_arg| Ok(Value::String(data_string.clone()))),
    );

    let _ = ctx.set_value("data_len".to_string(), Value::Int(binding.data.len() as i64));

    ctx
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Empty => false,
        Value::Boolean(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::String(s) => !(s.is_empty() || s == "0" || s == "false"),
        Value::Tuple(items) => !items.is_empty(),
    }
}

/// Surface a compile failure the way the pipeline engine is expected to:
/// log it and keep going, with the runner acting as `pass` for this run.
pub fn log_compile_failure(runner_name: &str, slot: &str, err: &EventBridgeError) {
    warn!(runner = runner_name, slot, error = %err, "predicate failed to compile, runner passes traffic through unchanged");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding<'a>(meta: &'a HashMap<String, String>, data: &'a [u8]) -> EvalBinding<'a> {
        EvalBinding { metadata: meta, data }
    }

    #[test]
    fn empty_expression_is_always_true() {
        let p = compile(None).unwrap();
        let meta = HashMap::new();
        assert!(p.eval(&binding(&meta, b"")).unwrap());
    }

    #[test]
    fn metadata_equality() {
        let p = compile(Some(r#"metadata("flag") == "yes""#)).unwrap();
        let mut meta = HashMap::new();
        meta.insert("flag".to_string(), "yes".to_string());
        assert!(p.eval(&binding(&meta, b"")).unwrap());

        meta.insert("flag".to_string(), "no".to_string());
        assert!(!p.eval(&binding(&meta, b"")).unwrap());
    }

    #[test]
    fn data_len_predicate() {
        let p = compile(Some("data_len > 0")).unwrap();
        let meta = HashMap::new();
        assert!(!p.eval(&binding(&meta, b"")).unwrap());
        assert!(p.eval(&binding(&meta, b"x")).unwrap());
    }

    #[test]
    fn disallowed_function_rejected() {
        let err = compile(Some("math::sqrt(4) == 2")).unwrap_err();
        assert!(matches!(err, EventBridgeError::PredicateCompile(_)));
    }

    #[test]
    fn unbalanced_parens_rejected() {
        let err = compile(Some("(metadata(\"x\") == \"y\"")).unwrap_err();
        assert!(matches!(err, EventBridgeError::PredicateCompile(_)));
    }

    #[test]
    fn bool_coercion_strings() {
        assert!(!coerce_bool(&Value::String("".to_string())));
        assert!(!coerce_bool(&Value::String("0".to_string())));
        assert!(!coerce_bool(&Value::String("false".to_string())));
        assert!(coerce_bool(&Value::String("anything-else".to_string())));
        assert!(!coerce_bool(&Value::Empty));
        assert!(!coerce_bool(&Value::Tuple(vec![])));
        assert!(coerce_bool(&Value::Tuple(vec![Value::Int(1)])));
    }
}
