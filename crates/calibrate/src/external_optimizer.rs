//! Optimizer collaborator that runs as an external program.
//!
//! The program is invoked once per call with a subcommand (`init` or
//! `update`), receives one JSON request on stdin and answers with one JSON
//! object on stdout. A non-zero exit status is a collaborator failure and
//! stderr is carried in the error.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use orchestration::{
    EnsembleOutputMatrix, Optimizer, OptimizerError, OptimizerState, ParameterMatrix, Prior,
    UpdateOutcome,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct InitRequest<'a> {
    prior: &'a Prior,
    ensemble_size: u32,
    seed: u64,
}

#[derive(Deserialize)]
struct InitResponse {
    ensemble: ParameterMatrix,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    state: &'a OptimizerState,
    outputs: &'a EnsembleOutputMatrix,
    observations: &'a [f64],
    #[serde(skip_serializing_if = "Option::is_none")]
    noise: Option<&'a Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    state: Option<OptimizerState>,
    #[serde(default)]
    terminate: bool,
    /// Set by the program when the update diverged.
    #[serde(default)]
    error: Option<String>,
}

/// [`Optimizer`] backed by an external program speaking JSON over stdio.
#[derive(Debug, Clone)]
pub struct CommandOptimizer {
    program: PathBuf,
    args: Vec<String>,
    observations: Vec<f64>,
    noise: Option<Vec<Vec<f64>>>,
}

impl CommandOptimizer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            observations: Vec::new(),
            noise: None,
        }
    }

    /// Observations and noise forwarded with every update request.
    pub fn with_observations(
        mut self,
        observations: Vec<f64>,
        noise: Option<Vec<Vec<f64>>>,
    ) -> Self {
        self.observations = observations;
        self.noise = noise;
        self
    }

    fn invoke<Req, Resp>(&self, subcommand: &str, request: &Req) -> Result<Resp, OptimizerError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request).map_err(|e| {
            OptimizerError::InvalidInput(format!("failed to encode {subcommand} request: {e}"))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                OptimizerError::Collaborator(format!(
                    "failed to start {}: {e}",
                    self.program.display()
                ))
            })?;

        // stdin is fed from its own thread while stdout is drained here.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(&payload))
        });

        let output = child.wait_with_output().map_err(|e| {
            OptimizerError::Collaborator(format!("failed to wait for optimizer: {e}"))
        })?;

        if let Some(handle) = writer {
            match handle.join() {
                Ok(Ok(())) => {}
                // Exit status decides; the program may skip its input.
                Ok(Err(e)) => debug!(error = %e, "Optimizer closed stdin early"),
                Err(_) => {
                    return Err(OptimizerError::Collaborator(
                        "stdin writer thread panicked".into(),
                    ))
                }
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OptimizerError::Collaborator(format!(
                "{} {subcommand} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        debug!(
            subcommand,
            bytes = output.stdout.len(),
            "Optimizer responded"
        );
        serde_json::from_slice(&output.stdout).map_err(|e| {
            OptimizerError::Collaborator(format!("invalid {subcommand} response: {e}"))
        })
    }
}

impl Optimizer for CommandOptimizer {
    fn generate_initial_ensemble(
        &self,
        prior: &Prior,
        ensemble_size: u32,
        seed: u64,
    ) -> Result<ParameterMatrix, OptimizerError> {
        let response: InitResponse = self.invoke(
            "init",
            &InitRequest {
                prior,
                ensemble_size,
                seed,
            },
        )?;
        Ok(response.ensemble)
    }

    fn update(
        &self,
        state: &OptimizerState,
        outputs: &EnsembleOutputMatrix,
    ) -> Result<UpdateOutcome, OptimizerError> {
        let response: UpdateResponse = self.invoke(
            "update",
            &UpdateRequest {
                state,
                outputs,
                observations: &self.observations,
                noise: self.noise.as_ref(),
            },
        )?;

        if let Some(reason) = response.error {
            return Err(OptimizerError::Diverged(reason));
        }
        let state = response.state.ok_or_else(|| {
            OptimizerError::Collaborator("update response carries no state".into())
        })?;
        Ok(UpdateOutcome {
            state,
            terminate: response.terminate,
        })
    }
}
