//! Shutdown coordinator: close components in the reverse of
//! construction order, retrying each transient failure up to 3 times with a
//! fixed 1s delay, and aggregate whatever is left.

use std::time::Duration;

use async_trait::async_trait;
use eb_core::EventBridgeError;
use tracing::error;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Anything the coordinator can close: a boxed Source/Runner/Target, or a
/// test double.
#[async_trait]
pub trait ClosableComponent: Send {
    async fn close(&mut self) -> Result<(), EventBridgeError>;
    fn label(&self) -> String;
}

pub struct ShutdownCoordinator {
    // Held in construction order; closed in reverse.
    components: Vec<Box<dyn ClosableComponent>>,
    cached_errors: Option<Vec<String>>,
}

impl ShutdownCoordinator {
    pub fn new(components: Vec<Box<dyn ClosableComponent>>) -> Self {
        Self {
            components,
            cached_errors: None,
        }
    }

    /// Idempotent: a second call returns the same aggregated result without
    /// invoking any component's `close` again.
    pub async fn close_all(&mut self) -> Result<(), EventBridgeError> {
        if let Some(errors) = &self.cached_errors {
            return to_result(errors.clone());
        }

        let mut errors = Vec::new();
        for component in self.components.iter_mut().rev() {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match component.close().await {
                    Ok(()) => break,
                    Err(err) => {
                        error!(
                            component = %component.label(),
                            attempt,
                            error = %err,
                            "component close failed"
                        );
                        if attempt >= MAX_ATTEMPTS {
                            errors.push(format!("{}: {}", component.label(), err));
                            break;
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        self.cached_errors = Some(errors.clone());
        to_result(errors)
    }
}

fn to_result(errors: Vec<String>) -> Result<(), EventBridgeError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EventBridgeError::Close(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyComponent {
        label: String,
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl ClosableComponent for FlakyComponent {
        async fn close(&mut self) -> Result<(), EventBridgeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(EventBridgeError::Close(vec!["transient".into()]))
            } else {
                Ok(())
            }
        }
        fn label(&self) -> String {
            self.label.clone()
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let comp = FlakyComponent {
            label: "flaky".into(),
            calls: calls.clone(),
            fail_times: 2,
        };
        let mut coord = ShutdownCoordinator::new(vec![Box::new(comp)]);
        assert!(coord.close_all().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts_and_is_idempotent() {
        let calls = Arc::new(AtomicU32::new(0));
        let comp = FlakyComponent {
            label: "always-broken".into(),
            calls: calls.clone(),
            fail_times: 100,
        };
        let mut coord = ShutdownCoordinator::new(vec![Box::new(comp)]);
        let first = coord.close_all().await;
        assert!(first.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let second = coord.close_all().await;
        assert!(second.is_err());
        // no further close() calls on the second invocation
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
