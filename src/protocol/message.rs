//! Protocol messages for remote fit control.
//!
//! Defines the message envelope and the optimizer event payloads that travel
//! inside `OPTIMIZER_UPDATE` frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Action commands carried by an `ACTION` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Start a fit with the held model and parameters
    StartFit,
    /// Stop the running fit and close the session
    StopFit,
}

impl ActionKind {
    /// Wire code for this action
    pub fn code(self) -> u8 {
        match self {
            Self::StartFit => 1,
            Self::StopFit => 2,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::StartFit),
            2 => Some(Self::StopFit),
            _ => None,
        }
    }
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Free-form log or status line
    Text(String),
    /// Liveness probe, answered with a `Text` carrying the same text
    Echo(String),
    /// Fit control command
    Action(ActionKind),
    /// Wholesale replacement of the held model and optimizer configuration
    ModelTransfer {
        /// Serialized problem definition (opaque to the session)
        model: Bytes,
        /// Serialized optimizer configuration (opaque to the session)
        fit_params: Bytes,
    },
    /// Optimizer event, server to client only
    OptimizerUpdate(OptimizerUpdate),
}

impl Message {
    /// Create a TEXT message
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create an ECHO message
    pub fn echo(text: impl Into<String>) -> Self {
        Self::Echo(text.into())
    }

    /// Create a START_FIT action
    pub fn start_fit() -> Self {
        Self::Action(ActionKind::StartFit)
    }

    /// Create a STOP_FIT action
    pub fn stop_fit() -> Self {
        Self::Action(ActionKind::StopFit)
    }

    /// Create a MODEL_TRANSFER message
    pub fn model_transfer(model: impl Into<Bytes>, fit_params: impl Into<Bytes>) -> Self {
        Self::ModelTransfer {
            model: model.into(),
            fit_params: fit_params.into(),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "TEXT",
            Self::Echo(_) => "ECHO",
            Self::Action(ActionKind::StartFit) => "ACTION(START_FIT)",
            Self::Action(ActionKind::StopFit) => "ACTION(STOP_FIT)",
            Self::ModelTransfer { .. } => "MODEL_TRANSFER",
            Self::OptimizerUpdate(update) => update.kind(),
        }
    }

    /// Whether only the server may send this message
    pub fn is_server_only(&self) -> bool {
        matches!(self, Self::OptimizerUpdate(_))
    }
}

/// Optimizer event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerUpdate {
    /// Parameter metadata and population snapshot
    ParameterInfo(ParameterInfo),
    /// Periodic progress snapshot
    Progress(ProgressUpdate),
    /// Terminal result of a run
    Result(ResultInfo),
}

impl OptimizerUpdate {
    /// Wire sub-tag for this payload
    pub fn code(&self) -> u8 {
        match self {
            Self::ParameterInfo(_) => 1,
            Self::Progress(_) => 2,
            Self::Result(_) => 3,
        }
    }

    /// Whether every number in the payload is finite.
    ///
    /// JSON has no representation for NaN or infinity.
    pub fn is_finite(&self) -> bool {
        fn all(values: &[f64]) -> bool {
            values.iter().all(|v| v.is_finite())
        }
        match self {
            Self::ParameterInfo(info) => {
                all(&info.values)
                    && all(&info.min_values)
                    && all(&info.max_values)
                    && info.population.iter().all(|v| all(v))
            },
            Self::Progress(progress) => {
                all(&progress.fom_history)
                    && all(&progress.best_values)
                    && progress.simulated.iter().all(|v| all(v))
            },
            Self::Result(result) => {
                all(&result.best_values) && result.fom.map_or(true, f64::is_finite)
            },
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::ParameterInfo(_) => "OPTIMIZER_UPDATE(PARAMETER_INFO)",
            Self::Progress(_) => "OPTIMIZER_UPDATE(PROGRESS)",
            Self::Result(_) => "OPTIMIZER_UPDATE(RESULT)",
        }
    }
}

/// Parameter metadata reported when a fit starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    /// Parameter names, in vector order
    pub names: Vec<String>,
    /// Current best values
    pub values: Vec<f64>,
    /// Lower bounds
    pub min_values: Vec<f64>,
    /// Upper bounds
    pub max_values: Vec<f64>,
    /// Population snapshot (one vector per individual)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub population: Vec<Vec<f64>>,
}

/// Periodic progress snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Generations completed
    pub generation: u64,
    /// Best figure of merit after each generation
    pub fom_history: Vec<f64>,
    /// Simulated curves for the current best vector
    pub simulated: Vec<Vec<f64>>,
    /// Current best parameter vector
    pub best_values: Vec<f64>,
    /// Whether this generation improved the best figure of merit
    pub new_best: bool,
}

impl ProgressUpdate {
    /// Best figure of merit so far
    pub fn best_fom(&self) -> Option<f64> {
        self.fom_history.last().copied()
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Figure of merit reached the requested tolerance
    Converged,
    /// Generation budget exhausted
    MaxGenerations,
    /// Stopped on request
    Stopped,
    /// Solver failed
    Failed(String),
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Best parameter vector found
    pub best_values: Vec<f64>,
    /// Figure of merit of the best vector (absent when the run failed early)
    pub fom: Option<f64>,
    /// Generations completed
    pub generations: u64,
    /// Why the run ended
    pub termination: TerminationReason,
}

impl ResultInfo {
    /// Result for a run that failed before producing a best vector
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            best_values: Vec::new(),
            fom: None,
            generations: 0,
            termination: TerminationReason::Failed(message.into()),
        }
    }

    /// Whether the run ended without a failure
    pub fn is_success(&self) -> bool {
        !matches!(self.termination, TerminationReason::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes() {
        assert_eq!(ActionKind::from_code(1), Some(ActionKind::StartFit));
        assert_eq!(ActionKind::from_code(2), Some(ActionKind::StopFit));
        assert_eq!(ActionKind::from_code(0), None);
        assert_eq!(ActionKind::StopFit.code(), 2);
    }

    #[test]
    fn test_server_only() {
        let update = Message::OptimizerUpdate(OptimizerUpdate::Progress(ProgressUpdate::default()));
        assert!(update.is_server_only());
        assert!(!Message::echo("ping").is_server_only());
        assert_eq!(update.kind(), "OPTIMIZER_UPDATE(PROGRESS)");
    }

    #[test]
    fn test_failed_result() {
        let result = ResultInfo::failed("model has no parameters");
        assert!(!result.is_success());
        assert!(result.best_values.is_empty());
        assert_eq!(
            result.termination,
            TerminationReason::Failed("model has no parameters".to_string())
        );
    }

    #[test]
    fn test_update_finiteness() {
        let mut progress = ProgressUpdate {
            fom_history: vec![2.0, 1.0],
            simulated: vec![vec![0.5, 1.5]],
            ..Default::default()
        };
        assert!(OptimizerUpdate::Progress(progress.clone()).is_finite());

        progress.simulated[0][1] = f64::INFINITY;
        assert!(!OptimizerUpdate::Progress(progress).is_finite());

        let mut result = ResultInfo::failed("no parameters");
        assert!(OptimizerUpdate::Result(result.clone()).is_finite());
        result.fom = Some(f64::NAN);
        assert!(!OptimizerUpdate::Result(result).is_finite());

        let info = ParameterInfo {
            population: vec![vec![f64::NEG_INFINITY]],
            ..Default::default()
        };
        assert!(!OptimizerUpdate::ParameterInfo(info).is_finite());
    }

    #[test]
    fn test_progress_best_fom() {
        let progress = ProgressUpdate {
            generation: 3,
            fom_history: vec![4.0, 2.5, 1.0],
            ..Default::default()
        };
        assert_eq!(progress.best_fom(), Some(1.0));
        assert_eq!(ProgressUpdate::default().best_fom(), None);
    }
}
