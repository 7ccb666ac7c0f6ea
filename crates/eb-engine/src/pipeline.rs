//! The runner gate: predicate evaluation around each
//! runner, integrated into the per-runner stage rather than split into
//! separate stream stages.

use std::sync::Arc;

use eb_core::{EventBridgeError, Message, Runner, RunnerConfig};
use eb_expr::{log_compile_failure, EvalBinding, Predicate};
use tokio::sync::Mutex;

use crate::handler::{MessageHandler, StageOutcome};

/// A runner paired with its compiled predicates, ready to be driven by the
/// ordered filter-map combinator.
pub struct CompiledRunner {
    pub name: String,
    pub routines: usize,
    runner: Arc<Mutex<Box<dyn Runner>>>,
    if_predicate: Predicate,
    filter_predicate: Predicate,
    /// Set when either predicate failed to compile: the runner is skipped
    /// entirely rather than treated as
    /// always-true, since `process` itself must not run either.
    effectively_pass: bool,
    handler: MessageHandler,
}

impl CompiledRunner {
    pub fn new(config: &RunnerConfig, runner: Box<dyn Runner>) -> Self {
        let name = runner.name().to_string();
        let routines = eb_core::clamp_routines(config.routines);

        let mut effectively_pass = false;
        let if_predicate = match eb_expr::compile(config.if_expr.as_deref()) {
            Ok(p) => p,
            Err(e) => {
                log_compile_failure(&name, "ifExpr", &e);
                effectively_pass = true;
                Predicate::Always
            }
        };
        let filter_predicate = match eb_expr::compile(config.filter_expr.as_deref()) {
            Ok(p) => p,
            Err(e) => {
                log_compile_failure(&name, "filterExpr", &e);
                effectively_pass = true;
                Predicate::Always
            }
        };

        Self {
            handler: MessageHandler::new(name.clone()),
            name,
            routines,
            runner: Arc::new(Mutex::new(runner)),
            if_predicate,
            filter_predicate,
            effectively_pass,
        }
    }

    pub fn runner_handle(&self) -> Arc<Mutex<Box<dyn Runner>>> {
        self.runner.clone()
    }

    /// Apply the gate to one message: §4.3 steps 3a-3f.
    pub async fn gate(&self, msg: Message) -> StageOutcome {
        if self.effectively_pass {
            return StageOutcome::Forward(msg);
        }

        let mut msg = msg;

        // a/b: ifExpr — false skips only this runner; eval error naks.
        match self.eval(&self.if_predicate, &mut msg).await {
            Ok(true) => {}
            Ok(false) => return StageOutcome::Forward(msg),
            Err(e) => return self.handler.handle_runner_error(msg, e, "ifExpr").await,
        }

        // c: process — error naks and drops.
        {
            let mut runner = self.runner.lock().await;
            if let Err(e) = runner.process(&mut msg).await {
                return self
                    .handler
                    .handle_runner_error(msg, e, "process")
                    .await;
            }
        }

        // d/e: filterExpr — false acks and drops (handled, intentionally
        // filtered); eval error naks.
        match self.eval(&self.filter_predicate, &mut msg).await {
            Ok(true) => StageOutcome::Forward(msg),
            Ok(false) => self.handler.handle_filtered(msg, "filterExpr").await,
            Err(e) => self.handler.handle_runner_error(msg, e, "filterExpr").await,
        }
    }

    async fn eval(&self, predicate: &Predicate, msg: &mut Message) -> Result<bool, EventBridgeError> {
        if matches!(predicate, Predicate::Always) {
            return Ok(true);
        }
        let (metadata, data) = msg.metadata_and_data().await?;
        predicate.eval(&EvalBinding {
            metadata: &metadata,
            data: &data,
        })
    }
}
