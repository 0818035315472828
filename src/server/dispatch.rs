//! Inbound message dispatch.
//!
//! | Message              | Effect                                                  |
//! |----------------------|---------------------------------------------------------|
//! | `Text`               | logged                                                  |
//! | `Echo(t)`            | `Text(t)` queued before the next inbound is handled     |
//! | `ModelTransfer`      | held model replaced; refused in-band while running      |
//! | `Action(START_FIT)`  | bridge attached, fit started; no-op while running       |
//! | `Action(STOP_FIT)`   | session moves to teardown                               |
//! | `OptimizerUpdate`    | protocol violation, session closed                      |

use tokio::sync::mpsc::UnboundedSender;

use super::bridge::CallbackBridge;
use super::state::FitState;
use crate::error::{RemoteFitError, Result};
use crate::optimizer::Optimizer;
use crate::protocol::{ActionKind, Message, Session};

/// What the session loop does after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next message
    Continue,
    /// Tear the session down
    Stop,
}

/// Per-session view used to handle one message at a time
pub struct Dispatcher<'a> {
    /// Session being served
    pub session: &'a mut Session,
    /// Held model and fit parameters
    pub fit: &'a mut FitState,
    /// Shared optimizer
    pub optimizer: &'a dyn Optimizer,
    /// Callback bridge to attach on `START_FIT`
    pub bridge: &'a CallbackBridge,
    /// This session's outbound queue
    pub outbound: &'a UnboundedSender<Message>,
}

impl Dispatcher<'_> {
    /// Handle one inbound message.
    ///
    /// Recoverable failures are reported to the peer as `Text` and return
    /// `Flow::Continue`. An `Err` means the session must be torn down.
    pub fn dispatch(&mut self, message: Message) -> Result<Flow> {
        self.session.record_received();
        tracing::debug!(session = %self.session.id(), kind = message.kind(), "Dispatching");

        match message {
            Message::Text(text) => {
                tracing::info!(session = %self.session.id(), %text, "Client text");
                Ok(Flow::Continue)
            },
            Message::Echo(text) => {
                self.reply(Message::Text(text))?;
                Ok(Flow::Continue)
            },
            Message::ModelTransfer { model, fit_params } => {
                let outcome = self.transfer(model, fit_params);
                self.settle(outcome)
            },
            Message::Action(ActionKind::StartFit) => {
                let outcome = self.start_fit();
                self.settle(outcome)
            },
            Message::Action(ActionKind::StopFit) => {
                tracing::info!(session = %self.session.id(), "Stop requested by client");
                Ok(Flow::Stop)
            },
            other @ Message::OptimizerUpdate(_) => Err(RemoteFitError::ProtocolViolation(
                format!("client sent server-only message {}", other.kind()),
            )),
        }
    }

    fn transfer(&mut self, model: bytes::Bytes, fit_params: bytes::Bytes) -> Result<()> {
        if self.optimizer.is_running() {
            return Err(RemoteFitError::SessionBusy(
                "cannot replace the model while a fit is running".to_string(),
            ));
        }
        tracing::info!(
            session = %self.session.id(),
            model_bytes = model.len(),
            params_bytes = fit_params.len(),
            "Model transferred"
        );
        self.fit.replace(model, fit_params);
        Ok(())
    }

    fn start_fit(&mut self) -> Result<()> {
        if self.optimizer.is_running() {
            tracing::debug!(session = %self.session.id(), "Fit already running, ignoring START_FIT");
            return Ok(());
        }
        let (model, fit_params) = self.fit.snapshot().ok_or(RemoteFitError::NoModel)?;

        self.bridge.attach(self.outbound.clone());
        if let Err(e) = self.optimizer.start(model, fit_params) {
            self.bridge.detach();
            return Err(e);
        }
        tracing::info!(session = %self.session.id(), "Fit started");
        Ok(())
    }

    /// Recoverable failures go back to the peer as `Text`; anything else
    /// ends the session.
    fn settle(&self, outcome: Result<()>) -> Result<Flow> {
        match outcome {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if e.is_recoverable() => {
                self.report(&e)?;
                Ok(Flow::Continue)
            },
            Err(e) => Err(e),
        }
    }

    fn report(&self, err: &RemoteFitError) -> Result<()> {
        tracing::warn!(session = %self.session.id(), error = %err, "Request refused");
        self.reply(Message::text(format!("Error: {err}")))
    }

    fn reply(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RemoteFitError::TransportReset("session writer closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use crate::optimizer::OptimizerCallback;
    use crate::protocol::{OptimizerUpdate, ProgressUpdate};

    #[derive(Default)]
    struct Mock {
        running: AtomicBool,
        starts: AtomicUsize,
        started_with: Mutex<Option<(Bytes, Bytes)>>,
        refusal: Mutex<Option<RemoteFitError>>,
    }

    impl Optimizer for Mock {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn start(&self, model: Bytes, fit_params: Bytes) -> Result<()> {
            if let Some(err) = self.refusal.lock().unwrap().take() {
                return Err(err);
            }
            self.running.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.started_with.lock().unwrap() = Some((model, fit_params));
            Ok(())
        }
        fn request_stop(&self) {}
        fn subscribe(&self, _callbacks: Arc<dyn OptimizerCallback>) {}
    }

    struct Harness {
        session: Session,
        fit: FitState,
        optimizer: Mock,
        bridge: CallbackBridge,
        tx: UnboundedSender<Message>,
        rx: UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                session: Session::new("test"),
                fit: FitState::default(),
                optimizer: Mock::default(),
                bridge: CallbackBridge::new(),
                tx,
                rx,
            }
        }

        fn dispatch(&mut self, message: Message) -> Result<Flow> {
            Dispatcher {
                session: &mut self.session,
                fit: &mut self.fit,
                optimizer: &self.optimizer,
                bridge: &self.bridge,
                outbound: &self.tx,
            }
            .dispatch(message)
        }

        fn replies(&mut self) -> Vec<Message> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    #[test]
    fn test_echo_replies_with_text() {
        let mut h = Harness::new();
        assert_eq!(h.dispatch(Message::echo("ping")).unwrap(), Flow::Continue);
        assert_eq!(h.dispatch(Message::echo("pong")).unwrap(), Flow::Continue);
        assert_eq!(h.replies(), vec![Message::text("ping"), Message::text("pong")]);
        assert_eq!(h.session.stats().messages_received, 2);
    }

    #[test]
    fn test_text_is_only_logged() {
        let mut h = Harness::new();
        assert_eq!(h.dispatch(Message::text("hello")).unwrap(), Flow::Continue);
        assert!(h.replies().is_empty());
    }

    #[test]
    fn test_start_without_model() {
        let mut h = Harness::new();
        assert_eq!(h.dispatch(Message::start_fit()).unwrap(), Flow::Continue);
        assert_eq!(h.optimizer.starts.load(Ordering::SeqCst), 0);
        assert!(!h.bridge.is_attached());

        let replies = h.replies();
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], Message::Text(t) if t.contains("No model")));
    }

    #[test]
    fn test_transfer_then_start() {
        let mut h = Harness::new();
        h.dispatch(Message::model_transfer(&b"model"[..], &b"params"[..]))
            .unwrap();
        h.dispatch(Message::start_fit()).unwrap();

        assert!(h.bridge.is_attached());
        let started = h.optimizer.started_with.lock().unwrap().clone().unwrap();
        assert_eq!(&started.0[..], b"model");
        assert_eq!(&started.1[..], b"params");
        assert!(h.replies().is_empty());
    }

    #[test]
    fn test_optimizer_refusal_reported_in_band() {
        let mut h = Harness::new();
        h.dispatch(Message::model_transfer(&b"m"[..], &b"p"[..])).unwrap();
        *h.optimizer.refusal.lock().unwrap() =
            Some(RemoteFitError::Optimizer("invalid fit parameters".to_string()));

        assert_eq!(h.dispatch(Message::start_fit()).unwrap(), Flow::Continue);
        let replies = h.replies();
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], Message::Text(t) if t.contains("invalid fit parameters")));
        assert!(!h.bridge.is_attached());
    }

    #[test]
    fn test_start_failure_ends_session() {
        let mut h = Harness::new();
        h.dispatch(Message::model_transfer(&b"m"[..], &b"p"[..])).unwrap();
        *h.optimizer.refusal.lock().unwrap() = Some(RemoteFitError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "cannot spawn solver thread",
        )));

        let err = h.dispatch(Message::start_fit()).unwrap_err();
        assert!(!err.is_recoverable());
        assert!(h.replies().is_empty());
        assert!(!h.bridge.is_attached());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut h = Harness::new();
        h.dispatch(Message::model_transfer(&b"m"[..], &b"p"[..])).unwrap();
        h.dispatch(Message::start_fit()).unwrap();
        h.dispatch(Message::start_fit()).unwrap();

        assert_eq!(h.optimizer.starts.load(Ordering::SeqCst), 1);
        assert!(h.replies().is_empty());
    }

    #[test]
    fn test_transfer_while_running_is_busy() {
        let mut h = Harness::new();
        h.dispatch(Message::model_transfer(&b"m1"[..], &b"p1"[..]))
            .unwrap();
        h.dispatch(Message::start_fit()).unwrap();

        let flow = h
            .dispatch(Message::model_transfer(&b"m2"[..], &b"p2"[..]))
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(&h.fit.model().unwrap()[..], b"m1");

        let replies = h.replies();
        assert!(matches!(&replies[0], Message::Text(t) if t.contains("busy")));
    }

    #[test]
    fn test_stop_fit_ends_session() {
        let mut h = Harness::new();
        assert_eq!(h.dispatch(Message::stop_fit()).unwrap(), Flow::Stop);
    }

    #[test]
    fn test_inbound_update_is_violation() {
        let mut h = Harness::new();
        let err = h
            .dispatch(Message::OptimizerUpdate(OptimizerUpdate::Progress(
                ProgressUpdate::default(),
            )))
            .unwrap_err();
        assert!(matches!(err, RemoteFitError::ProtocolViolation(_)));
    }

    #[test]
    fn test_reply_after_writer_gone() {
        let mut h = Harness::new();
        h.rx.close();
        let err = h.dispatch(Message::echo("anyone?")).unwrap_err();
        assert!(err.is_disconnect());
    }
}
