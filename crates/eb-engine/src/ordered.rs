//! The ordered filter-map combinator: applies an async function with
//! `routines` parallel workers but emits results in input arrival order,
//! dropping items the function reports as filtered.
//!
//! Built directly on `tokio::sync::mpsc` + a shared, mutex-guarded receiver
//! for work distribution, keeping the reorder buffer's invariants easy to audit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eb_core::Message;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handler::StageOutcome;

/// Run `f` over every message read from `input`, with `routines` concurrent
/// workers, writing results to `output` in the order messages were read
/// from `input`. Stops when `input` closes or `output` closes; on
/// cancellation, workers finish their current item and stop pulling more.
pub async fn ordered_filter_map<F, Fut>(
    input: mpsc::Receiver<Message>,
    output: mpsc::Sender<Message>,
    routines: usize,
    cancel: CancellationToken,
    f: F,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageOutcome> + Send + 'static,
{
    let routines = routines.max(1);
    let input = Arc::new(Mutex::new(input));
    let next_index = Arc::new(AtomicU64::new(0));
    let f = Arc::new(f);

    let (result_tx, mut result_rx) = mpsc::channel::<(u64, StageOutcome)>(routines.max(1) * 2);

    let mut workers = Vec::with_capacity(routines);
    for worker_id in 0..routines {
        let input = input.clone();
        let next_index = next_index.clone();
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        let f = f.clone();
        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    debug!(worker_id, "ordered stage worker stopping on cancellation");
                    break;
                }
                let (idx, msg) = {
                    let mut guard = input.lock().await;
                    match guard.recv().await {
                        Some(msg) => {
                            let idx = next_index.fetch_add(1, Ordering::SeqCst);
                            (idx, msg)
                        }
                        None => break,
                    }
                };
                let outcome = f(msg).await;
                if result_tx.send((idx, outcome)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    // Reorder task: buffers out-of-order worker results and forwards them
    // downstream strictly in arrival order.
    let reorder = tokio::spawn(async move {
        let mut pending: HashMap<u64, StageOutcome> = HashMap::new();
        let mut next_emit: u64 = 0;
        while let Some((idx, outcome)) = result_rx.recv().await {
            pending.insert(idx, outcome);
            while let Some(outcome) = pending.remove(&next_emit) {
                next_emit += 1;
                if let StageOutcome::Forward(msg) = outcome {
                    if output.send(msg).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    for worker in workers {
        let _ = worker.await;
    }
    let _ = reorder.await;
}

/// The target stage's unordered for-each: same worker pool
/// shape, no reorder buffer, since side effects are the terminal action.
pub async fn unordered_for_each<F, Fut>(
    input: mpsc::Receiver<Message>,
    routines: usize,
    cancel: CancellationToken,
    f: F,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let routines = routines.max(1);
    let input = Arc::new(Mutex::new(input));
    let f = Arc::new(f);

    let mut workers = Vec::with_capacity(routines);
    for worker_id in 0..routines {
        let input = input.clone();
        let cancel = cancel.clone();
        let f = f.clone();
        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    debug!(worker_id, "target stage worker stopping on cancellation");
                    break;
                }
                let msg = {
                    let mut guard = input.lock().await;
                    guard.recv().await
                };
                match msg {
                    Some(msg) => f(msg).await,
                    None => break,
                }
            }
        }));
    }
    for worker in workers {
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eb_core::SourceAdapter;
    use std::collections::HashMap as StdHashMap;

    struct NullAdapter;
    #[async_trait::async_trait]
    impl SourceAdapter for NullAdapter {
        async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<StdHashMap<String, String>> {
            Ok(StdHashMap::new())
        }
        async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
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

    #[tokio::test]
    async fn preserves_order_under_parallel_workers() {
        let adapter: Arc<dyn SourceAdapter> = Arc::new(NullAdapter);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        for i in 0..20u8 {
            in_tx
                .send(Message::new(vec![i], adapter.clone()))
                .await
                .unwrap();
        }
        drop(in_tx);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ordered_filter_map(in_rx, out_tx, 8, cancel, |msg| async move {
            // Jitter-free but each worker races independently; reorder must fix it up.
            StageOutcome::Forward(msg)
        }));

        let mut seen = Vec::new();
        while let Some(msg) = out_rx.recv().await {
            seen.push(msg.id()[0]);
        }
        handle.await.unwrap();

        let expected: Vec<u8> = (0..20).collect();
        assert_eq!(seen, expected);
    }
}
