//! Optimizer callback bridge.
//!
//! Optimizer callbacks run on the optimizer's thread. The bridge turns each
//! one into a single outbound [`Message`] and pushes it onto the live
//! session's unbounded queue; the session's writer task is the only socket
//! writer. When no session is attached, events are dropped.

use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::optimizer::OptimizerCallback;
use crate::protocol::{Message, OptimizerUpdate, ParameterInfo, ProgressUpdate, ResultInfo};

/// Forwards optimizer events to the attached session
#[derive(Debug, Default)]
pub struct CallbackBridge {
    outbound: Mutex<Option<UnboundedSender<Message>>>,
}

impl CallbackBridge {
    /// Create a detached bridge
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events to a session's outbound queue
    pub fn attach(&self, outbound: UnboundedSender<Message>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(outbound);
        }
    }

    /// Stop routing events. Later events are dropped.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
    }

    /// Whether a session is attached
    pub fn is_attached(&self) -> bool {
        self.outbound.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Queue a message for the attached session. Returns false if dropped.
    pub fn forward(&self, message: Message) -> bool {
        let Ok(slot) = self.outbound.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!("Session writer gone, dropping optimizer event");
                    return false;
                }
                true
            },
            None => false,
        }
    }
}

impl OptimizerCallback for CallbackBridge {
    fn text_output(&self, text: &str) {
        self.forward(Message::text(text));
    }

    fn parameter_info(&self, info: ParameterInfo) {
        self.forward(Message::OptimizerUpdate(OptimizerUpdate::ParameterInfo(info)));
    }

    fn progress(&self, update: ProgressUpdate) {
        self.forward(Message::OptimizerUpdate(OptimizerUpdate::Progress(update)));
    }

    fn fitting_ended(&self, result: ResultInfo) {
        self.forward(Message::OptimizerUpdate(OptimizerUpdate::Result(result)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_detached_is_noop() {
        let bridge = CallbackBridge::new();
        assert!(!bridge.is_attached());
        bridge.text_output("lost");
        assert!(!bridge.forward(Message::text("lost")));
    }

    #[test]
    fn test_one_message_per_callback_in_order() {
        let bridge = CallbackBridge::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx);

        bridge.parameter_info(ParameterInfo::default());
        bridge.text_output("gen 1");
        bridge.progress(ProgressUpdate::default());
        bridge.fitting_ended(ResultInfo::failed("x"));

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "OPTIMIZER_UPDATE(PARAMETER_INFO)",
                "TEXT",
                "OPTIMIZER_UPDATE(PROGRESS)",
                "OPTIMIZER_UPDATE(RESULT)",
            ]
        );
    }

    #[test]
    fn test_detach_stops_forwarding() {
        let bridge = CallbackBridge::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx);
        bridge.detach();

        bridge.text_output("after detach");
        // Sender was dropped with the detach
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_forward_from_other_thread() {
        let bridge = std::sync::Arc::new(CallbackBridge::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.attach(tx);

        let remote = bridge.clone();
        std::thread::spawn(move || remote.text_output("from optimizer"))
            .join()
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Message::text("from optimizer"));
    }
}
