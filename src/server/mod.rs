//! Remote fit-control session server.
//!
//! Accepts TCP connections and serves exactly one authenticated session at
//! a time. A session can transfer a model, start and stop the optimizer,
//! and receives the optimizer's events as they are produced.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use remotefit::optimizer::{BackgroundOptimizer, DifferentialEvolution};
//! use remotefit::server::{ServerConfig, SessionServer};
//!
//! let optimizer = Arc::new(BackgroundOptimizer::new(DifferentialEvolution::new()));
//! let server = SessionServer::new(ServerConfig::default().with_port(3000), optimizer)?;
//! server.serve().await?;
//! ```

mod bridge;
mod cleanup;
mod config;
mod dispatch;
mod session_server;
mod state;

pub use bridge::CallbackBridge;
pub use cleanup::{CleanupSequencer, CleanupState, StopReason, DRAIN_POLL_INTERVAL};
pub use config::ServerConfig;
pub use dispatch::{Dispatcher, Flow};
pub use session_server::SessionServer;
pub use state::{FitState, ServerState};
