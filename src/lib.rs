//! # RemoteFit - Remote Fit-Control Protocol
//!
//! Drive a long-running curve-fitting optimizer on a remote host over a
//! single TCP connection: upload a model, start and stop fits, and receive
//! the optimizer's progress as it happens.
//!
//! ## Features
//!
//! - **Shared-key handshake**: keyed BLAKE2b challenge/response before any frame
//! - **Tagged, length-prefixed frames**: one self-delimiting frame per message
//! - **Single-session server**: later clients wait until the live session ends
//! - **Event streaming**: optimizer callbacks forwarded in production order
//! - **Cooperative cancellation**: stop, drain, then close, on every exit path
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                         Session Server                  Optimizer thread
//!    |                                 |                                |
//!    |--- challenge token ------------>|                                |
//!    |<-- response token --------------|                                |
//!    |                                 |                                |
//!    |--- MODEL_TRANSFER ------------->|                                |
//!    |--- ACTION(START_FIT) ---------->|--- start(model, params) ------>|
//!    |<-- OPTIMIZER_UPDATE ------------|<-- callbacks (bridge) ---------|
//!    |<-- OPTIMIZER_UPDATE ------------|<-- callbacks (bridge) ---------|
//!    |--- ACTION(STOP_FIT) ----------->|--- request_stop() ------------>|
//!    |<-- OPTIMIZER_UPDATE(RESULT) ----|<-- fitting_ended -------------|
//!    |<== connection closed ===========|    (after drain)               |
//! ```
//!
//! ### Session State Machine
//!
//! ```text
//!     [Connecting] ── lock acquired ──> [Authenticating]
//!                                         │         │
//!                          token matches  │         │ mismatch / short read
//!                                         v         v
//!                                     [Active]   [Closed]
//!                                         │
//!        STOP_FIT / disconnect / bad frame / shutdown
//!                                         v
//!                                     [Closing] ── stop, drain, flush ──> [Closed]
//! ```
//!
//! ### Wire Format
//!
//! | Field         | Size     | Notes                                  |
//! |---------------|----------|----------------------------------------|
//! | `tag`         | 1 byte   | TEXT=1 ECHO=2 ACTION=3 MODEL_TRANSFER=4 OPTIMIZER_UPDATE=5 |
//! | `payload_len` | 4 bytes  | big-endian, at most `MAX_FRAME_SIZE`   |
//! | `payload`     | variable | per-tag layout, see [`protocol`]       |
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use remotefit::optimizer::{BackgroundOptimizer, DifferentialEvolution};
//! use remotefit::{ServerConfig, SessionServer};
//!
//! let optimizer = Arc::new(BackgroundOptimizer::new(DifferentialEvolution::new()));
//! let server = SessionServer::new(ServerConfig::default(), optimizer)?;
//! server.serve().await?;
//! ```
//!
//! ### Client
//!
//! ```rust,ignore
//! use remotefit::{Message, RemoteClient, SharedKey};
//!
//! let mut client = RemoteClient::connect("127.0.0.1:3000", &SharedKey::default()).await?;
//! assert_eq!(client.echo("ping").await?, "ping");
//! client.transfer_model(model, fit_params).await?;
//! client.start_fit().await?;
//! while let Some(message) = client.recv().await? {
//!     println!("{}", message.kind());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Messages, framing, handshake and session lifecycle
//! - [`server`]: Single-session server, dispatcher, callback bridge, cleanup
//! - [`client`]: Client side of the protocol
//! - [`optimizer`]: Optimizer traits, background runner, differential evolution
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod error;
pub mod optimizer;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use client::RemoteClient;
pub use config::Config;
pub use error::{RemoteFitError, Result};
pub use optimizer::{
    BackgroundOptimizer, DifferentialEvolution, Optimizer, OptimizerCallback, Solver,
};
pub use protocol::{Message, Session, SessionState, SharedKey};
pub use server::{ServerConfig, SessionServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version
pub const PROTOCOL_VERSION: &str = "1";
