//! Server state shared by the accept loop and the session task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{watch, Mutex};

use super::bridge::CallbackBridge;
use super::config::ServerConfig;
use crate::error::Result;
use crate::optimizer::Optimizer;
use crate::protocol::Authenticator;

/// The single model and optimizer configuration a session works on
#[derive(Debug, Default, Clone)]
pub struct FitState {
    model: Option<Bytes>,
    fit_params: Option<Bytes>,
    transfers: u64,
}

impl FitState {
    /// Replace model and fit parameters wholesale
    pub fn replace(&mut self, model: Bytes, fit_params: Bytes) {
        self.model = Some(model);
        self.fit_params = Some(fit_params);
        self.transfers += 1;
    }

    /// Copies of the held model and fit parameters, if any
    pub fn snapshot(&self) -> Option<(Bytes, Bytes)> {
        match (&self.model, &self.fit_params) {
            (Some(model), Some(params)) => Some((model.clone(), params.clone())),
            _ => None,
        }
    }

    /// Whether a model has been transferred
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Held model bytes
    pub fn model(&self) -> Option<&Bytes> {
        self.model.as_ref()
    }

    /// Number of accepted transfers
    pub fn transfers(&self) -> u64 {
        self.transfers
    }
}

/// State shared across connection tasks
pub struct ServerState {
    /// Server configuration
    pub config: ServerConfig,
    /// Handshake tokens derived from the configured key
    pub auth: Authenticator,
    /// Optimizer driven by sessions
    pub optimizer: Arc<dyn Optimizer>,
    /// Forwards optimizer events to the live session
    pub bridge: Arc<CallbackBridge>,
    /// Session lock; holding it is what makes a session live
    pub session_lock: Mutex<FitState>,
    /// Shutdown signal
    pub shutdown: watch::Sender<bool>,
    /// Server start time
    pub start_time: Instant,
}

impl ServerState {
    /// Create server state and subscribe the bridge to the optimizer
    pub fn new(config: ServerConfig, optimizer: Arc<dyn Optimizer>) -> Result<Self> {
        let auth = Authenticator::new(&config.key)?;
        let bridge = Arc::new(CallbackBridge::new());
        optimizer.subscribe(bridge.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            auth,
            optimizer,
            bridge,
            session_lock: Mutex::new(FitState::default()),
            shutdown,
            start_time: Instant::now(),
        })
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_state_replace() {
        let mut fit = FitState::default();
        assert!(!fit.is_loaded());
        assert!(fit.snapshot().is_none());

        fit.replace(Bytes::from_static(b"m1"), Bytes::from_static(b"p1"));
        fit.replace(Bytes::from_static(b"m2"), Bytes::from_static(b"p2"));
        assert_eq!(fit.transfers(), 2);
        let (model, params) = fit.snapshot().unwrap();
        assert_eq!(&model[..], b"m2");
        assert_eq!(&params[..], b"p2");
    }
}
