//! Error taxonomy for the calibration engine.
//!
//! | Error                 | Scope       | Effect                                    |
//! |-----------------------|-------------|-------------------------------------------|
//! | `BackendError`        | one member  | absorbed by the lifecycle (retry/exhaust) |
//! | `CheckpointError`     | run         | fatal                                     |
//! | `OptimizerError`      | run         | fatal, diagnostics persisted first        |
//! | `Configuration`       | run         | fatal, reported immediately               |
//! | `Interrupted`         | run         | fatal, never retried, index not advanced  |
//!
//! Member-level errors never unwind past the iteration barrier.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by an execution backend for a single job.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Job submission failed: {0}")]
    Submit(String),

    #[error("Scheduler command failed: {0}")]
    CommandFailed(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reading or writing the iteration-indexed checkpoint layout.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Malformed checkpoint layout: {0}")]
    Malformed(String),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Failures reported by the external optimizer collaborator.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    #[error("Optimizer diverged: {0}")]
    Diverged(String),

    #[error("Invalid optimizer input: {0}")]
    InvalidInput(String),

    #[error("Optimizer collaborator failed: {0}")]
    Collaborator(String),
}

/// Fatal errors that terminate a calibration run.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Initial ensemble generation failed: {0}")]
    InitialEnsemble(#[source] OptimizerError),

    #[error("Update step failed at iteration {iteration}: {source}")]
    UpdateFailed {
        iteration: u32,
        #[source]
        source: OptimizerError,
    },

    #[error("Iteration {iteration} aborted: members {members:?} exhausted their retry budget")]
    IterationAborted { iteration: u32, members: Vec<u32> },

    #[error("Run interrupted during iteration {iteration}")]
    Interrupted { iteration: u32 },

    #[error("Wall-clock limit of {limit:?} expired during iteration {iteration}")]
    WallClockExpired { iteration: u32, limit: Duration },

    #[error("Illegal driver transition: {from} → {to}")]
    IllegalTransition { from: String, to: String },
}

impl OrchestrationError {
    /// Operator-requested cancellation, as opposed to a failure.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Checkpoint(CheckpointError::Malformed(_))
        )
    }
}

/// A fatal run error together with the safe resume point.
#[derive(Debug, Error)]
#[error("{error} (last checkpointed iteration: {})", describe_checkpoint(.last_checkpoint))]
pub struct RunFailure {
    #[source]
    pub error: OrchestrationError,
    /// Highest iteration whose state blob is on disk, if any.
    pub last_checkpoint: Option<u32>,
}

fn describe_checkpoint(last: &Option<u32>) -> String {
    match last {
        Some(i) => format!("{:03}", i),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failure_reports_resume_point() {
        let failure = RunFailure {
            error: OrchestrationError::Interrupted { iteration: 4 },
            last_checkpoint: Some(4),
        };
        let msg = failure.to_string();
        assert!(msg.contains("interrupted during iteration 4"));
        assert!(msg.contains("last checkpointed iteration: 004"));

        let fresh = RunFailure {
            error: OrchestrationError::Configuration("ensemble_size must be >= 1".into()),
            last_checkpoint: None,
        };
        assert!(fresh.to_string().ends_with("none)"));
    }

    #[test]
    fn test_interruption_is_distinguished() {
        assert!(OrchestrationError::Interrupted { iteration: 0 }.is_interruption());
        assert!(!OrchestrationError::WallClockExpired {
            iteration: 0,
            limit: Duration::from_secs(1)
        }
        .is_interruption());
        assert!(
            OrchestrationError::Checkpoint(CheckpointError::Malformed("x".into()))
                .is_configuration()
        );
    }
}
