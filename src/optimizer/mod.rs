//! Optimizer runtime.
//!
//! The session server drives fits through the [`Optimizer`] trait and
//! receives events through [`OptimizerCallback`]. Optimizers run on their own
//! thread; callbacks arrive from that thread and must not block.
//!
//! ```text
//! session ──start/request_stop──> Optimizer ──(OS thread)──> Solver
//!    ^                                                         |
//!    └──── Message channel <── CallbackBridge <── callbacks ───┘
//! ```
//!
//! [`BackgroundOptimizer`] adapts any [`Solver`] to the trait, and
//! [`DifferentialEvolution`] is the built-in solver.

mod background;
mod diffev;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::{ParameterInfo, ProgressUpdate, ResultInfo};

pub use background::{BackgroundOptimizer, SolveContext, Solver};
pub use diffev::{CurveModel, DifferentialEvolution, FitParams, ModelParameter};

/// Receiver of optimizer events.
///
/// Called from the optimizer's thread. Implementations hand the event off
/// and return immediately.
pub trait OptimizerCallback: Send + Sync {
    /// Free-form status line
    fn text_output(&self, text: &str);

    /// Parameter metadata, emitted once when a fit starts
    fn parameter_info(&self, info: ParameterInfo);

    /// Periodic progress snapshot
    fn progress(&self, update: ProgressUpdate);

    /// Terminal event of a run, emitted exactly once per `start`
    fn fitting_ended(&self, result: ResultInfo);
}

/// Callback sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallback;

impl OptimizerCallback for NullCallback {
    fn text_output(&self, _text: &str) {}
    fn parameter_info(&self, _info: ParameterInfo) {}
    fn progress(&self, _update: ProgressUpdate) {}
    fn fitting_ended(&self, _result: ResultInfo) {}
}

/// Handle to an optimizer that runs fits in the background.
pub trait Optimizer: Send + Sync {
    /// Whether a run is in progress.
    ///
    /// Becomes false only after `fitting_ended` has been delivered.
    fn is_running(&self) -> bool;

    /// Start a run on copies of the model and fit parameters.
    ///
    /// Returns once the run is launched. Fails if a run is already active.
    fn start(&self, model: Bytes, fit_params: Bytes) -> Result<()>;

    /// Ask the active run to stop cooperatively. No-op when idle.
    fn request_stop(&self);

    /// Replace the callback receiver
    fn subscribe(&self, callbacks: Arc<dyn OptimizerCallback>);
}
