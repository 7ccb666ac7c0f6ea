//! Centralized ack/nak + logging policy.

use eb_core::{EventBridgeError, Message};
use tracing::{error, info, warn};

/// The outcome of a single stage applied to one message: forward it
/// downstream, or drop it (it has already been terminated by ack/nak).
pub enum StageOutcome {
    Forward(Message),
    Drop,
}

/// Holds the component name used in log fields and concentrates the
/// ack/nak policy so stages don't each reimplement "log then
/// ack-or-nak-and-warn-on-failure".
#[derive(Clone)]
pub struct MessageHandler {
    component: String,
}

impl MessageHandler {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Log success at info, ack; if ack fails log at error. A `None`
    /// message is handled defensively (warn, no crash).
    pub async fn handle_success(&self, msg: Option<&mut Message>, operation: &str) {
        let Some(msg) = msg else {
            warn!(component = %self.component, operation, "handle_success called with no message");
            return;
        };
        info!(component = %self.component, operation, id = ?msg.id(), "handled message");
        if let Err(err) = msg.ack().await {
            error!(component = %self.component, operation, error = %err, "ack failed");
        }
    }

    /// Log the error, nak; if nak fails log at error.
    pub async fn handle_error(&self, msg: Option<&mut Message>, err: &EventBridgeError, operation: &str) {
        let Some(msg) = msg else {
            warn!(component = %self.component, operation, error = %err, "handle_error called with no message");
            return;
        };
        error!(component = %self.component, operation, error = %err, id = ?msg.id(), "message handling failed");
        if let Err(nak_err) = msg.nak().await {
            error!(component = %self.component, operation, error = %nak_err, "nak failed");
        }
    }

    /// Shape required by the ordered filter-map adaptor: nak the message and
    /// report "drop".
    pub async fn handle_runner_error(
        &self,
        mut msg: Message,
        err: EventBridgeError,
        operation: &str,
    ) -> StageOutcome {
        self.handle_error(Some(&mut msg), &err, operation).await;
        StageOutcome::Drop
    }

    /// Ack and drop — used when `filterExpr` rejects a message: it has been
    /// successfully processed and intentionally filtered out.
    pub async fn handle_filtered(&self, mut msg: Message, operation: &str) -> StageOutcome {
        self.handle_success(Some(&mut msg), operation).await;
        StageOutcome::Drop
    }
}
