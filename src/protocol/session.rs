//! Session lifecycle tracking.
//!
//! One `Session` exists per accepted connection, from accept to close.

use std::time::{Duration, Instant};

use crate::error::{RemoteFitError, Result};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for the session lock
    Connecting,
    /// Holding the lock, running the handshake
    Authenticating,
    /// Authenticated, processing messages
    Active,
    /// Cleanup in progress
    Closing,
    /// Connection torn down
    Closed,
}

impl SessionState {
    /// Whether the session holds the server-wide session lock
    pub fn holds_lock(self) -> bool {
        matches!(self, Self::Authenticating | Self::Active | Self::Closing)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticating)
                | (Self::Connecting, Self::Closed)
                | (Self::Authenticating, Self::Active)
                | (Self::Authenticating, Self::Closing)
                | (Self::Authenticating, Self::Closed)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Remote fit-control session
#[derive(Debug)]
pub struct Session {
    /// Session ID
    id: String,
    /// Peer address (for logging)
    peer: String,
    /// Current state
    state: SessionState,
    /// Accept timestamp
    opened_at: Instant,
    /// Messages received
    messages_received: u64,
    /// Messages queued for sending
    messages_sent: u64,
}

impl Session {
    /// Create a session for a freshly accepted connection
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer: peer.into(),
            state: SessionState::Connecting,
            opened_at: Instant::now(),
            messages_received: 0,
            messages_sent: 0,
        }
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if session is active
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Move to the next state
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RemoteFitError::ProtocolViolation(format!(
                "Cannot move session from {:?} to {:?}",
                self.state, next
            )));
        }
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        Ok(())
    }

    /// Count an inbound message
    pub fn record_received(&mut self) {
        self.messages_received += 1;
    }

    /// Count frames written to the peer
    pub fn record_sent(&mut self, frames: u64) {
        self.messages_sent += frames;
    }

    /// Time since accept
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            uptime_secs: self.age().as_secs(),
        }
    }
}

/// Session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Current state
    pub state: SessionState,
    /// Messages sent (replies queued by the dispatcher)
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Session uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new("127.0.0.1:5000");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.state().holds_lock());

        session.transition(SessionState::Authenticating).unwrap();
        assert!(session.state().holds_lock());
        session.transition(SessionState::Active).unwrap();
        assert!(session.is_active());
        session.transition(SessionState::Closing).unwrap();
        session.transition(SessionState::Closed).unwrap();
        assert!(!session.state().holds_lock());
    }

    #[test]
    fn test_handshake_failure_path() {
        let mut session = Session::new("peer");
        session.transition(SessionState::Authenticating).unwrap();
        session.transition(SessionState::Closed).unwrap();
    }

    #[test]
    fn test_invalid_transition() {
        let mut session = Session::new("peer");
        assert!(session.transition(SessionState::Active).is_err());
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(Session::new("a").id(), Session::new("a").id());
    }

    #[test]
    fn test_session_stats() {
        let mut session = Session::new("peer");
        session.record_received();
        session.record_received();
        session.record_sent(3);
        session.record_sent(1);

        let stats = session.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.state, SessionState::Connecting);
    }
}
