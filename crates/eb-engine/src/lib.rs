//! # eb-engine — pipeline assembly
//!
//! Wires eb-core's connector contract and eb-expr's predicates into a
//! running pipeline: one source feeds an ordered chain of
//! runner stages over bounded channels, which feeds either a target or a
//! reply-to-source tail. `Bridge::build` constructs every connector from a
//! `BridgeConfig`; `Bridge::spawn` starts the stream and the stage tasks and
//! hands back a `RunningBridge` the bootstrap binary drives to completion
//! and shuts down.

pub mod handler;
pub mod ordered;
pub mod pipeline;
pub mod shutdown;

use std::sync::Arc;

use async_trait::async_trait;
use eb_core::{BridgeConfig, ConnectorRegistry, Message, Operator, Result, Runner, Source, Target};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::handler::MessageHandler;
use crate::ordered::{ordered_filter_map, unordered_for_each};
use crate::pipeline::CompiledRunner;
use crate::shutdown::{ClosableComponent, ShutdownCoordinator};

/// Everything needed to run one pipeline, constructed but not yet started.
pub struct Bridge {
    source: Box<dyn Source>,
    source_buffer: usize,
    runners: Vec<CompiledRunner>,
    target: Option<Box<dyn Target>>,
    target_routines: usize,
}

impl Bridge {
    /// Construct the source, every runner, and the optional target by
    /// resolving each declared connector type against `registry`.
    pub fn build(config: BridgeConfig, registry: &ConnectorRegistry) -> Result<Self> {
        let source = registry.build_source(&config.source.kind, config.source.options.clone())?;

        let mut runners = Vec::with_capacity(config.runners.len());
        for runner_config in &config.runners {
            let runner =
                registry.build_runner(&runner_config.kind, runner_config.options.clone())?;
            runners.push(CompiledRunner::new(runner_config, runner));
        }

        let (target, target_routines) = match &config.target {
            Some(t) if !t.is_none() => (
                Some(registry.build_target(&t.kind, t.options.clone())?),
                eb_core::clamp_routines(t.routines),
            ),
            // Reply-to-source tail is sequential: one originating transport,
            // so concurrent replies would only add contention.
            _ => (None, 1),
        };

        Ok(Self {
            source_buffer: config.source.buffer,
            source,
            runners,
            target,
            target_routines,
        })
    }

    /// Start the source stream and spawn every stage. Returns a handle the
    /// caller awaits for natural drain, or cancels/closes for shutdown.
    pub async fn spawn(mut self, cancel: CancellationToken) -> Result<RunningBridge> {
        let source_name = self.source.name().to_string();
        let stream = self.source.produce(self.source_buffer).await?;

        let mut closables: Vec<Box<dyn ClosableComponent>> = Vec::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let source = Arc::new(Mutex::new(self.source));
        closables.push(Box::new(SourceClose {
            source,
            name: source_name,
        }));

        let (ingress_tx, ingress_rx) = mpsc::channel::<Message>(self.source_buffer);
        let ingress_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(msg) = stream.next().await {
                if ingress_cancel.is_cancelled() {
                    // Drain the stream without forwarding so the source
                    // isn't left blocked trying to hand off the next item.
                    continue;
                }
                if ingress_tx.send(msg).await.is_err() {
                    break;
                }
            }
        }));

        let mut current_rx = ingress_rx;
        for compiled in self.runners {
            let (next_tx, next_rx) = mpsc::channel::<Message>(self.source_buffer);
            let routines = compiled.routines;
            let runner_name = compiled.name.clone();
            closables.push(Box::new(RunnerClose {
                runner: compiled.runner_handle(),
                name: runner_name,
            }));

            let compiled = Arc::new(compiled);
            let stage_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                ordered_filter_map(current_rx, next_tx, routines, stage_cancel, move |msg| {
                    let compiled = compiled.clone();
                    async move { compiled.gate(msg).await }
                })
                .await;
            }));
            current_rx = next_rx;
        }

        match self.target {
            Some(target) => {
                let target_name = target.name().to_string();
                let target = Arc::new(Mutex::new(target));
                closables.push(Box::new(TargetClose {
                    target: target.clone(),
                    name: target_name.clone(),
                }));
                let handler = MessageHandler::new(target_name);
                let tail_cancel = cancel.clone();
                let routines = self.target_routines;
                handles.push(tokio::spawn(async move {
                    unordered_for_each(current_rx, routines, tail_cancel, move |mut msg| {
                        let target = target.clone();
                        let handler = handler.clone();
                        async move {
                            let outcome = target.lock().await.consume(&mut msg).await;
                            match outcome {
                                Ok(()) => handler.handle_success(Some(&mut msg), "consume").await,
                                Err(err) => {
                                    handler.handle_error(Some(&mut msg), &err, "consume").await
                                }
                            }
                        }
                    })
                    .await;
                }));
            }
            None => {
                let handler = MessageHandler::new("reply-to-source");
                let tail_cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    unordered_for_each(current_rx, 1, tail_cancel, move |mut msg| {
                        let handler = handler.clone();
                        async move {
                            if let Err(err) = msg.reply_source().await {
                                handler.handle_error(Some(&mut msg), &err, "reply").await;
                            }
                        }
                    })
                    .await;
                }));
            }
        }

        Ok(RunningBridge {
            handles,
            shutdown: ShutdownCoordinator::new(closables),
            cancel,
        })
    }
}

/// A spawned pipeline: the bootstrap binary awaits `join` for natural
/// drain, or calls `cancel` then `close` to shut down early.
pub struct RunningBridge {
    handles: Vec<JoinHandle<()>>,
    shutdown: ShutdownCoordinator,
    cancel: CancellationToken,
}

impl RunningBridge {
    /// Await every stage task. Returns once the source stream has ended and
    /// every message it produced has reached a terminal stage.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "pipeline stage task panicked");
            }
        }
    }

    /// Signal every stage to stop pulling new work once its current item is
    /// done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the source, every runner, and the target/nothing, in reverse
    /// construction order, with retry. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown.close_all().await
    }
}

struct SourceClose {
    source: Arc<Mutex<Box<dyn Source>>>,
    name: String,
}

#[async_trait]
impl ClosableComponent for SourceClose {
    async fn close(&mut self) -> Result<()> {
        self.source.lock().await.close().await
    }
    fn label(&self) -> String {
        format!("source:{}", self.name)
    }
}

struct RunnerClose {
    runner: Arc<Mutex<Box<dyn Runner>>>,
    name: String,
}

#[async_trait]
impl ClosableComponent for RunnerClose {
    async fn close(&mut self) -> Result<()> {
        self.runner.lock().await.close().await
    }
    fn label(&self) -> String {
        format!("runner:{}", self.name)
    }
}

struct TargetClose {
    target: Arc<Mutex<Box<dyn Target>>>,
    name: String,
}

#[async_trait]
impl ClosableComponent for TargetClose {
    async fn close(&mut self) -> Result<()> {
        self.target.lock().await.close().await
    }
    fn label(&self) -> String {
        format!("target:{}", self.name)
    }
}
