//! Session teardown.
//!
//! Every way a session can end goes through the same sequence:
//!
//! ```text
//! Idle ──request_stop──> StopRequested ──drain──> Draining ──close──> Closed
//! ```
//!
//! 1. `request_stop`: if a fit is running, ask it to stop (once).
//! 2. `drain`: poll `is_running()` every [`DRAIN_POLL_INTERVAL`] until the
//!    fit has ended. There is no timeout.
//! 3. `close`: detach the bridge, flush queued frames, shut the write side.
//!    The caller drops the read side and releases the session lock.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::bridge::CallbackBridge;
use crate::optimizer::Optimizer;
use crate::protocol::Message;

/// Interval between `is_running()` checks while draining
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Client sent `STOP_FIT`
    StopFit,
    /// Peer closed or reset the connection
    Disconnect,
    /// Undecodable frame
    MalformedFrame,
    /// Peer sent a message it may not send
    ProtocolViolation,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StopFit => "stop requested",
            Self::Disconnect => "peer disconnected",
            Self::MalformedFrame => "malformed frame",
            Self::ProtocolViolation => "protocol violation",
            Self::Shutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Teardown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    /// Session still live
    Idle,
    /// Stop requested (at most one `request_stop` reaches the optimizer)
    StopRequested,
    /// Waiting for the fit to end
    Draining,
    /// Connection torn down
    Closed,
}

/// Runs the teardown sequence for one session
#[derive(Debug)]
pub struct CleanupSequencer {
    session_id: String,
    state: CleanupState,
    reason: Option<StopReason>,
    stop_sent: bool,
}

impl CleanupSequencer {
    /// Create a sequencer for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: CleanupState::Idle,
            reason: None,
            stop_sent: false,
        }
    }

    /// Current phase
    pub fn state(&self) -> CleanupState {
        self.state
    }

    /// First reason given for the teardown
    pub fn reason(&self) -> Option<StopReason> {
        self.reason
    }

    /// Begin teardown. Later calls are swallowed.
    pub fn request_stop(&mut self, optimizer: &dyn Optimizer, reason: StopReason) {
        if self.state != CleanupState::Idle {
            tracing::debug!(session = %self.session_id, %reason, "Stop already requested");
            return;
        }
        self.state = CleanupState::StopRequested;
        self.reason = Some(reason);

        if optimizer.is_running() && !self.stop_sent {
            tracing::info!(session = %self.session_id, %reason, "Stopping running fit");
            optimizer.request_stop();
            self.stop_sent = true;
        }
    }

    /// Wait until the optimizer reports it is no longer running
    pub async fn drain(&mut self, optimizer: &dyn Optimizer) {
        self.state = CleanupState::Draining;
        let mut polls = 0u64;
        while optimizer.is_running() {
            polls += 1;
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        if polls > 0 {
            tracing::debug!(session = %self.session_id, polls, "Optimizer drained");
        }
    }

    /// Detach the bridge, flush outbound frames and close the write side.
    ///
    /// Returns the number of frames the writer put on the wire.
    pub async fn close(
        &mut self,
        bridge: &CallbackBridge,
        outbound: UnboundedSender<Message>,
        writer: JoinHandle<u64>,
    ) -> u64 {
        bridge.detach();
        drop(outbound);

        let written = match writer.await {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "Writer task failed");
                0
            },
        };
        self.state = CleanupState::Closed;
        written
    }
}
