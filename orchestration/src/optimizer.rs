//! Contract with the external optimizer collaborator.
//!
//! The update rule and ensemble generation are opaque. Both calls are
//! synchronous and must not touch the checkpoint layout; the driver runs
//! them on the blocking pool.

use serde::{Deserialize, Serialize};

use crate::ensemble::{EnsembleOutputMatrix, ParameterMatrix};
use crate::error::OptimizerError;

/// Opaque prior distribution handle.
///
/// Only `parameter_names` is read by the orchestration (to label rendered
/// parameter files); `spec` is handed to the optimizer untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Prior {
    #[serde(default)]
    pub parameter_names: Vec<String>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Prior {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parameter_names: names.into_iter().map(Into::into).collect(),
            spec: serde_json::Value::Null,
        }
    }

    /// Name of parameter `idx`, falling back to a positional name.
    pub fn parameter_name(&self, idx: usize) -> String {
        self.parameter_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("param_{:03}", idx))
    }
}

/// Optimizer state persisted between iterations.
///
/// `ensemble` holds one parameter vector per member for the iteration this
/// state belongs to; `blob` is whatever else the optimizer carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub ensemble: ParameterMatrix,
    #[serde(default)]
    pub blob: serde_json::Value,
}

impl OptimizerState {
    /// State seeded from a freshly generated ensemble.
    pub fn initial(ensemble: ParameterMatrix) -> Self {
        Self {
            ensemble,
            blob: serde_json::Value::Null,
        }
    }
}

/// Result of one optimizer update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub state: OptimizerState,
    /// The optimizer asks the run to stop after this iteration.
    pub terminate: bool,
}

impl UpdateOutcome {
    pub fn proceed(state: OptimizerState) -> Self {
        Self {
            state,
            terminate: false,
        }
    }

    pub fn terminate(state: OptimizerState) -> Self {
        Self {
            state,
            terminate: true,
        }
    }
}

/// External optimizer collaborator.
///
/// `update` receives a matrix that may contain sentinel entries for members
/// that exhausted their retry budget; it is never called with an all-sentinel
/// matrix.
pub trait Optimizer: Send + Sync {
    fn generate_initial_ensemble(
        &self,
        prior: &Prior,
        ensemble_size: u32,
        seed: u64,
    ) -> Result<ParameterMatrix, OptimizerError>;

    fn update(
        &self,
        state: &OptimizerState,
        outputs: &EnsembleOutputMatrix,
    ) -> Result<UpdateOutcome, OptimizerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_name_fallback() {
        let prior = Prior::named(["porosity", "perm"]);
        assert_eq!(prior.parameter_name(1), "perm");
        assert_eq!(prior.parameter_name(2), "param_002");
    }

    #[test]
    fn test_state_blob_defaults_to_null() {
        let state: OptimizerState = serde_json::from_str(r#"{"ensemble": [[1.0], [2.0]]}"#)
            .expect("state without blob parses");
        assert_eq!(state.ensemble.len(), 2);
        assert!(state.blob.is_null());
    }
}
