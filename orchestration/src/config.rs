//! Run configuration: experiment definition, retry policy, failure policy.
//!
//! All values are explicit; nothing here reads the process environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;
use crate::optimizer::Prior;

/// Largest index that fits the 3-digit directory layout.
pub const MAX_LAYOUT_INDEX: u32 = 999;

/// Poll loops never sleep less than this between backend polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Immutable description of one calibration experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Number of update iterations to run (≥ 1).
    pub iteration_count: u32,
    /// Number of ensemble members per iteration (≥ 1).
    pub ensemble_size: u32,
    /// Observation vector the optimizer calibrates against.
    pub observations: Vec<f64>,
    /// Observation noise covariance (square, side = observations.len()).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<Vec<Vec<f64>>>,
    /// Opaque prior handle passed through to the optimizer.
    pub prior: Prior,
    /// Root of the iteration-indexed checkpoint layout.
    pub output_dir: PathBuf,
    /// Seed for initial ensemble generation.
    #[serde(default)]
    pub seed: u64,
}

impl ExperimentConfig {
    /// Check every invariant the orchestration relies on.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.iteration_count == 0 {
            return Err(OrchestrationError::Configuration(
                "iteration_count must be at least 1".into(),
            ));
        }
        // Iterations are zero-based: the last one is iteration_count - 1.
        if self.iteration_count > MAX_LAYOUT_INDEX + 1 {
            return Err(OrchestrationError::Configuration(format!(
                "iteration_count {} does not fit the iteration_NNN layout",
                self.iteration_count
            )));
        }
        if self.ensemble_size == 0 {
            return Err(OrchestrationError::Configuration(
                "ensemble_size must be at least 1".into(),
            ));
        }
        if self.ensemble_size > MAX_LAYOUT_INDEX {
            return Err(OrchestrationError::Configuration(format!(
                "ensemble_size {} does not fit the member_MMM layout",
                self.ensemble_size
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(OrchestrationError::Configuration(
                "output_dir must not be empty".into(),
            ));
        }
        if let Some(noise) = &self.noise {
            let n = self.observations.len();
            if noise.len() != n || noise.iter().any(|row| row.len() != n) {
                return Err(OrchestrationError::Configuration(format!(
                    "noise covariance must be {n}x{n} to match the observations"
                )));
            }
        }
        Ok(())
    }
}

/// Retry and polling policy applied by every member's lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub backoff_factor: f64,
    /// Upper bound on any single retry delay.
    pub max_retry_delay: Duration,
    /// Sleep between polls of a submitted job.
    pub poll_interval: Duration,
    /// Bound on a single poll call.
    pub poll_timeout: Duration,
    /// Consecutive poll errors/timeouts before an attempt is abandoned.
    pub max_consecutive_poll_errors: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(30),
            max_consecutive_poll_errors: 5,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before starting attempt `failed_attempt + 1`.
    pub fn retry_delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.retry_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_retry_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Poll interval clamped to [`MIN_POLL_INTERVAL`].
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// What an iteration does when a member exhausts its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the member, substitute a sentinel output, and run the update.
    #[default]
    ContinueWithSentinel,
    /// Abort the run; the iteration is retried from its checkpoint on resume.
    AbortIteration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            iteration_count: 3,
            ensemble_size: 5,
            observations: vec![1.0, 2.0],
            noise: Some(vec![vec![0.1, 0.0], vec![0.0, 0.1]]),
            prior: Prior::named(["k"]),
            output_dir: PathBuf::from("/tmp/exp"),
            seed: 7,
        }
    }

    #[test]
    fn test_valid_experiment() {
        assert!(experiment().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_ensemble_and_iterations() {
        let mut cfg = experiment();
        cfg.ensemble_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = experiment();
        cfg.iteration_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_indices_beyond_layout_width() {
        let mut cfg = experiment();
        cfg.ensemble_size = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = experiment();
        cfg.iteration_count = 1000;
        assert!(cfg.validate().is_ok());
        cfg.iteration_count = 1001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_mismatched_noise() {
        let mut cfg = experiment();
        cfg.noise = Some(vec![vec![1.0]]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_delay_backoff_and_cap() {
        let policy = RetryPolicy {
            retry_delay: Duration::from_secs(2),
            backoff_factor: 3.0,
            max_retry_delay: Duration::from_secs(20),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.retry_delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay_for(2), Duration::from_secs(6));
        assert_eq!(policy.retry_delay_for(3), Duration::from_secs(18));
        assert_eq!(policy.retry_delay_for(4), Duration::from_secs(20));
    }

    #[test]
    fn test_attempts_and_poll_floor() {
        let policy = RetryPolicy {
            max_retries: 1,
            poll_interval: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.effective_poll_interval(), MIN_POLL_INTERVAL);
    }
}
