//! Single-session TCP server.
//!
//! # Architecture
//!
//! ```text
//! accept loop ──spawn──> connection task
//!                          │ lock session (FIFO; later connections park here)
//!                          │ handshake
//!                          │ ┌──────────── message loop ─────────────┐
//!                          │ │ read_message ─> Dispatcher ─> outbound │──> writer task ──> socket
//!                          │ └────────────────────────────────────────┘        ^
//!                          │ cleanup: stop, drain, close                       │
//!                          │ unlock                      optimizer ──> CallbackBridge
//! ```
//!
//! The writer task is the only thing that writes frames to the socket, so
//! echo replies and optimizer events never interleave mid-frame.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::cleanup::{CleanupSequencer, StopReason};
use super::config::ServerConfig;
use super::dispatch::{Dispatcher, Flow};
use super::state::{FitState, ServerState};
use crate::error::{RemoteFitError, Result};
use crate::optimizer::Optimizer;
use crate::protocol::{self, read_message, write_message, Message, Session, SessionState};

/// Remote fit-control server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionServer {
    state: Arc<ServerState>,
}

impl SessionServer {
    /// Create a server driving `optimizer`
    pub fn new(config: ServerConfig, optimizer: Arc<dyn Optimizer>) -> Result<Self> {
        Ok(Self {
            state: Arc::new(ServerState::new(config, optimizer)?),
        })
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Remote fit server listening on {}", listener.local_addr()?);
        let mut shutdown = self.state.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, peer.to_string()).await;
                        });
                    },
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.changed() => {},
            }
        }

        drop(listener);
        tracing::info!("Server shutting down, waiting for the live session");
        let _idle = self.state.session_lock.lock().await;
        tracing::info!("Server stopped (uptime {:?})", self.state.uptime());
        Ok(())
    }

    /// Serve one connection to completion.
    ///
    /// Waits for the session lock, runs the handshake, processes messages,
    /// and always ends with the cleanup sequence once authenticated.
    pub async fn serve_connection<S>(&self, stream: S, peer: impl Into<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = &self.state;
        let mut session = Session::new(peer);
        tracing::info!(session = %session.id(), peer = %session.peer(), "Connection accepted");

        let mut fit = state.session_lock.lock().await;
        if state.is_shutting_down() {
            tracing::info!(session = %session.id(), "Dropping queued connection, server shutting down");
            advance(&mut session, SessionState::Closed);
            return;
        }
        advance(&mut session, SessionState::Authenticating);

        let (mut reader, mut writer) = tokio::io::split(stream);
        if let Err(e) = protocol::accept(&state.auth, &mut reader, &mut writer).await {
            tracing::warn!(session = %session.id(), error = %e, "Handshake failed, closing");
            advance(&mut session, SessionState::Closed);
            return;
        }
        advance(&mut session, SessionState::Active);
        tracing::info!(session = %session.id(), "Session authenticated");

        let (outbound, queued) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, queued, session.id().to_string()));

        let reason = self
            .message_loop(&mut session, &mut fit, &mut reader, &outbound)
            .await;

        advance(&mut session, SessionState::Closing);
        let mut cleanup = CleanupSequencer::new(session.id());
        cleanup.request_stop(state.optimizer.as_ref(), reason);
        cleanup.drain(state.optimizer.as_ref()).await;
        let sent = cleanup.close(&state.bridge, outbound, writer_task).await;
        session.record_sent(sent);
        drop(reader);

        advance(&mut session, SessionState::Closed);
        let stats = session.stats();
        tracing::info!(
            session = %stats.session_id,
            %reason,
            received = stats.messages_received,
            sent = stats.messages_sent,
            uptime_secs = stats.uptime_secs,
            "Session closed"
        );
    }

    async fn message_loop<R>(
        &self,
        session: &mut Session,
        fit: &mut FitState,
        reader: &mut R,
        outbound: &UnboundedSender<Message>,
    ) -> StopReason
    where
        R: AsyncRead + Unpin + Send,
    {
        let state = &self.state;
        let mut shutdown = state.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                return StopReason::Shutdown;
            }

            let read = tokio::select! {
                read = read_message(reader, state.config.max_frame_size) => read,
                _ = shutdown.changed() => return StopReason::Shutdown,
            };

            let message = match read {
                Ok(Some(message)) => message,
                Ok(None) => return StopReason::Disconnect,
                Err(e) if e.is_disconnect() => {
                    tracing::info!(session = %session.id(), error = %e, "Peer disconnected");
                    return StopReason::Disconnect;
                },
                Err(e) => {
                    tracing::warn!(session = %session.id(), error = %e, "Closing session");
                    return StopReason::MalformedFrame;
                },
            };

            let mut dispatcher = Dispatcher {
                session: &mut *session,
                fit: &mut *fit,
                optimizer: state.optimizer.as_ref(),
                bridge: &state.bridge,
                outbound,
            };
            match dispatcher.dispatch(message) {
                Ok(Flow::Continue) => {},
                Ok(Flow::Stop) => return StopReason::StopFit,
                Err(e) if e.is_disconnect() => return StopReason::Disconnect,
                Err(e) => {
                    tracing::warn!(session = %session.id(), error = %e, "Closing session");
                    return StopReason::ProtocolViolation;
                },
            }
        }
    }

    /// Stop accepting, tear down the live session and drop queued ones
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }
}

/// Move the session along its lifecycle, logging a refused transition
fn advance(session: &mut Session, next: SessionState) {
    if let Err(e) = session.transition(next) {
        tracing::debug!(session = %session.id(), error = %e, "Session transition refused");
    }
}

/// Sole writer for one session's socket. Returns the number of frames written.
///
/// A message that cannot be encoded is logged and skipped; an I/O error
/// ends the writer.
async fn write_loop<W>(
    mut writer: W,
    mut queued: UnboundedReceiver<Message>,
    session_id: String,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(message) = queued.recv().await {
        tracing::debug!(session = %session_id, kind = message.kind(), "Sending");
        match write_message(&mut writer, &message).await {
            Ok(()) => written += 1,
            Err(e @ RemoteFitError::MalformedFrame(_)) => {
                tracing::warn!(session = %session_id, error = %e, "Dropping unencodable message");
            },
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Write failed");
                return written;
            },
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(session = %session_id, error = %e, "Shutdown of write side failed");
    }
    written
}
