use thiserror::Error;

/// Engine-level error kinds.
///
/// Disposition (fatal at startup vs. per-message) is documented on each
/// variant; the pipeline never lets a per-message error kill the run loop.
#[derive(Debug, Error)]
pub enum EventBridgeError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// A connector factory returned an error. Fatal at startup.
    #[error("connector construct error ({connector}): {source}")]
    ConnectorConstruct {
        connector: String,
        #[source]
        source: anyhow::Error,
    },

    /// `Source::produce` failed. Fatal at startup.
    #[error("source produce error: {0}")]
    SourceProduce(#[source] anyhow::Error),

    /// `ifExpr`/`filterExpr` failed to compile. Logged, runner is skipped.
    #[error("predicate compile error: {0}")]
    PredicateCompile(String),

    /// Expression runtime failure. Message is naked.
    #[error("predicate eval error: {0}")]
    PredicateEval(String),

    /// `Runner::process` returned an error. Message is naked.
    #[error("runner process error: {0}")]
    RunnerProcess(#[source] anyhow::Error),

    /// `Target::consume` returned an error. Message is naked.
    #[error("target consume error: {0}")]
    TargetConsume(#[source] anyhow::Error),

    /// The source adapter failed to ack/nak. Logged, pipeline continues.
    #[error("ack/nak error: {0}")]
    AckNak(#[source] anyhow::Error),

    /// The source does not implement reply. Treated as a nak by the engine.
    #[error("source does not support reply")]
    ReplyUnsupported,

    /// A component's `Close` failed after retries.
    #[error("close errors: {0:?}")]
    Close(Vec<String>),
}

pub type Result<T> = std::result::Result<T, EventBridgeError>;
