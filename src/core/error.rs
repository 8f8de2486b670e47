//! SC-002: Error taxonomy.
//!
//! Config, workflow lookup, cycle/starvation, ledger and I/O errors abort a
//! run. Stage failures are recorded in the ledger and published as error
//! artifacts instead of being raised.

use thiserror::Error;

/// One structural problem found while validating a config document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or internally inconsistent configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The requested workflow is not declared.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// Scheduler iteration bound exceeded.
    #[error(
        "workflow '{workflow}' did not settle after {iterations} iterations \
         (dependency cycle or starved stage); pending: {}", .pending.join(", ")
    )]
    CycleOrStarvation {
        workflow: String,
        iterations: usize,
        pending: Vec<String>,
    },

    /// A stage implementation failed, returned nothing, or was skipped
    /// behind a failed upstream. Recorded per stage, never raised mid-run.
    #[error("stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    /// Unknown output type or an encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Build a `Config` error from a list of validation findings.
    pub fn from_validation(errors: &[ValidationError]) -> Self {
        let joined = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self::Config(format!("{} validation error(s): {}", errors.len(), joined))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

/// Error returned by a stage implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<PipelineError> for StageError {
    fn from(err: PipelineError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("io error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
