//! Calibration driver: the iteration loop as a guarded state machine.
//!
//! ```text
//! Initializing → IterationRunning(i) | IterationUpdating(i) | Terminated
//! IterationRunning(i)  → IterationUpdating(i)
//! IterationUpdating(i) → IterationRunning(i + 1) | Terminated
//! any non-terminal     → Failed
//! ```
//!
//! Iteration i+1 never begins before iteration i's state is committed, and
//! an interrupted run never advances the committed index.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::BackendClient;
use crate::barrier::{BarrierReport, IterationBarrier};
use crate::checkpoint::{CheckpointStore, RunCompletion};
use crate::config::{ExperimentConfig, FailurePolicy, RetryPolicy};
use crate::ensemble::{EnsembleOutputMatrix, JsonOutputReader, OutputReader, ParameterMatrix};
use crate::error::{CheckpointError, OptimizerError, OrchestrationError, RunFailure};
use crate::forward_model::ModelCommand;
use crate::optimizer::{Optimizer, OptimizerState, UpdateOutcome};

/// Default bound on in-flight backend polls across one iteration.
pub const DEFAULT_POLL_CONCURRENCY: usize = 16;

/// Driver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Initializing,
    IterationRunning(u32),
    IterationUpdating(u32),
    Terminated,
    Failed,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::IterationRunning(i) => write!(f, "IterationRunning({i})"),
            Self::IterationUpdating(i) => write!(f, "IterationUpdating({i})"),
            Self::Terminated => write!(f, "Terminated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

fn is_legal_transition(from: DriverState, to: DriverState) -> bool {
    use DriverState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    match (from, to) {
        (Initializing, IterationRunning(_))
        | (Initializing, IterationUpdating(_))
        | (Initializing, Terminated) => true,
        (IterationRunning(i), IterationUpdating(j)) => i == j,
        (IterationUpdating(i), IterationRunning(j)) => j == i + 1,
        (IterationUpdating(_), Terminated) => true,
        _ => false,
    }
}

/// A single recorded driver state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverTransition {
    pub from: DriverState,
    pub to: DriverState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a run that reached `Terminated`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Barriers executed by this process (excludes resumed updates).
    pub iterations_run: u32,
    pub final_iteration: u32,
    /// The optimizer asked to stop before `iteration_count` was reached.
    pub terminated_early: bool,
    /// Iteration the run resumed from, if a checkpoint was found.
    pub resumed_from: Option<u32>,
    pub reports: Vec<BarrierReport>,
    pub final_state: OptimizerState,
}

/// Runs one calibration experiment to termination.
pub struct CalibrationDriver {
    experiment: ExperimentConfig,
    backend: Arc<dyn BackendClient>,
    optimizer: Arc<dyn Optimizer>,
    model: ModelCommand,
    store: CheckpointStore,
    retry_policy: RetryPolicy,
    failure_policy: FailurePolicy,
    wall_clock_limit: Option<Duration>,
    output_reader: Arc<dyn OutputReader>,
    max_concurrent_polls: usize,
    cancel: CancellationToken,
    state: DriverState,
    transitions: Vec<DriverTransition>,
}

impl CalibrationDriver {
    pub fn new(
        experiment: ExperimentConfig,
        backend: Arc<dyn BackendClient>,
        optimizer: Arc<dyn Optimizer>,
        model: ModelCommand,
    ) -> Result<Self, OrchestrationError> {
        experiment.validate()?;
        let store = CheckpointStore::new(experiment.output_dir.clone());
        Ok(Self {
            experiment,
            backend,
            optimizer,
            model,
            store,
            retry_policy: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            wall_clock_limit: None,
            output_reader: Arc::new(JsonOutputReader::default()),
            max_concurrent_polls: DEFAULT_POLL_CONCURRENCY,
            cancel: CancellationToken::new(),
            state: DriverState::Initializing,
            transitions: Vec::new(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_wall_clock_limit(mut self, limit: Option<Duration>) -> Self {
        self.wall_clock_limit = limit;
        self
    }

    pub fn with_output_reader(mut self, reader: Arc<dyn OutputReader>) -> Self {
        self.output_reader = reader;
        self
    }

    pub fn with_poll_concurrency(mut self, max_concurrent_polls: usize) -> Self {
        self.max_concurrent_polls = max_concurrent_polls.max(1);
        self
    }

    /// Use an externally owned token; cancelling it interrupts the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn transitions(&self) -> &[DriverTransition] {
        &self.transitions
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run (or resume) the experiment until it terminates or fails.
    pub async fn run(&mut self) -> Result<RunSummary, RunFailure> {
        match self.run_inner().await {
            Ok(summary) => Ok(summary),
            Err(error) => {
                let reason = error.to_string();
                if let Err(e) = self.advance(DriverState::Failed, Some(&reason)) {
                    warn!("{}", e);
                }
                let last_checkpoint = match self.store.latest_checkpoint() {
                    Ok(cp) => cp.map(|c| c.iteration),
                    Err(e) => {
                        warn!("Could not determine last checkpoint: {}", e);
                        None
                    }
                };
                if error.is_interruption() {
                    warn!(?last_checkpoint, "Calibration interrupted");
                } else {
                    error!(?last_checkpoint, "Calibration failed: {}", error);
                }
                Err(RunFailure {
                    error,
                    last_checkpoint,
                })
            }
        }
    }

    fn advance(
        &mut self,
        to: DriverState,
        reason: Option<&str>,
    ) -> Result<(), OrchestrationError> {
        if !is_legal_transition(self.state, to) {
            return Err(OrchestrationError::IllegalTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        info!(from = %self.state, to = %to, "Driver transition");
        self.transitions.push(DriverTransition {
            from: self.state,
            to,
            at: Utc::now(),
            reason: reason.map(str::to_string),
        });
        self.state = to;
        Ok(())
    }

    async fn run_inner(&mut self) -> Result<RunSummary, OrchestrationError> {
        if let Some(completion) = self.store.completion()? {
            info!(
                final_iteration = completion.final_iteration,
                "Run already complete; nothing to do"
            );
            self.advance(DriverState::Terminated, Some("run_complete.json present"))?;
            return self.summary_from_completion(completion);
        }

        let deadline = self
            .wall_clock_limit
            .map(|limit| tokio::time::Instant::now() + limit);
        let iteration_count = self.experiment.iteration_count;

        let (mut iteration, mut state, mut resumed_outputs, resumed_from) =
            match self.store.latest_checkpoint()? {
                None => {
                    let ensemble = self.generate_initial_ensemble().await?;
                    let state = OptimizerState::initial(ensemble);
                    self.store.save_state(0, &state, &self.experiment.prior)?;
                    (0, state, None, None)
                }
                Some(cp) => {
                    let state = self.store.load_state(cp.iteration)?;
                    self.check_ensemble(cp.iteration, &state.ensemble)?;
                    let outputs = if cp.has_outputs {
                        Some(
                            self.store
                                .load_outputs(cp.iteration, self.experiment.ensemble_size)?,
                        )
                    } else {
                        None
                    };
                    info!(
                        iteration = cp.iteration,
                        has_outputs = cp.has_outputs,
                        "Resuming from checkpoint"
                    );
                    (cp.iteration, state, outputs, Some(cp.iteration))
                }
            };

        if iteration >= iteration_count {
            return Err(OrchestrationError::Configuration(format!(
                "checkpoint at iteration {} is beyond iteration_count {}",
                iteration, iteration_count
            )));
        }

        let mut reports = Vec::new();
        let mut iterations_run = 0;
        loop {
            let outputs = match resumed_outputs.take() {
                Some(outputs) => {
                    self.advance(
                        DriverState::IterationUpdating(iteration),
                        Some("outputs already persisted"),
                    )?;
                    if let Some(report) = self.store.load_report(iteration)? {
                        reports.push(report);
                    }
                    outputs
                }
                None => {
                    self.advance(DriverState::IterationRunning(iteration), None)?;
                    let (report, outputs) = self.run_iteration(iteration, deadline).await?;
                    reports.push(report);
                    iterations_run += 1;
                    self.advance(DriverState::IterationUpdating(iteration), None)?;
                    outputs
                }
            };

            let outcome = self.update(iteration, &state, &outputs).await?;
            let finished = outcome.terminate || iteration + 1 >= iteration_count;
            if finished {
                let completion = RunCompletion {
                    final_iteration: iteration,
                    terminated_early: outcome.terminate && iteration + 1 < iteration_count,
                    completed_at: Utc::now(),
                    final_state: outcome.state,
                };
                self.store.mark_complete(&completion)?;
                self.advance(DriverState::Terminated, None)?;
                info!(
                    final_iteration = iteration,
                    terminated_early = completion.terminated_early,
                    iterations_run,
                    "Calibration complete"
                );
                return Ok(RunSummary {
                    iterations_run,
                    final_iteration: iteration,
                    terminated_early: completion.terminated_early,
                    resumed_from,
                    reports,
                    final_state: completion.final_state,
                });
            }

            // An interrupt during the update leaves iteration + 1 uncommitted.
            if self.cancel.is_cancelled() {
                return Err(OrchestrationError::Interrupted { iteration });
            }
            self.store
                .save_state(iteration + 1, &outcome.state, &self.experiment.prior)?;
            state = outcome.state;
            iteration += 1;
        }
    }

    async fn generate_initial_ensemble(&self) -> Result<ParameterMatrix, OrchestrationError> {
        let optimizer = self.optimizer.clone();
        let prior = self.experiment.prior.clone();
        let size = self.experiment.ensemble_size;
        let seed = self.experiment.seed;

        let ensemble = tokio::task::spawn_blocking(move || {
            optimizer.generate_initial_ensemble(&prior, size, seed)
        })
        .await
        .map_err(|e| {
            OrchestrationError::InitialEnsemble(OptimizerError::Collaborator(format!(
                "initial ensemble task failed: {e}"
            )))
        })?
        .map_err(OrchestrationError::InitialEnsemble)?;

        if ensemble.len() != size as usize {
            return Err(OrchestrationError::InitialEnsemble(
                OptimizerError::InvalidInput(format!(
                    "optimizer generated {} members, expected {}",
                    ensemble.len(),
                    size
                )),
            ));
        }
        if let Some((member, col)) = ensemble.first_non_finite() {
            return Err(OrchestrationError::InitialEnsemble(
                OptimizerError::InvalidInput(format!(
                    "initial ensemble member {member} has a non-finite value in column {col}"
                )),
            ));
        }
        info!(members = size, seed, "Initial ensemble generated");
        Ok(ensemble)
    }

    fn check_ensemble(
        &self,
        iteration: u32,
        ensemble: &ParameterMatrix,
    ) -> Result<(), OrchestrationError> {
        let expected = self.experiment.ensemble_size as usize;
        if ensemble.len() != expected {
            return Err(CheckpointError::Malformed(format!(
                "iteration_{:03} state holds {} members, expected {}",
                iteration,
                ensemble.len(),
                expected
            ))
            .into());
        }
        Ok(())
    }

    /// Run every member of `iteration` and assemble its output matrix.
    async fn run_iteration(
        &self,
        iteration: u32,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(BarrierReport, EnsembleOutputMatrix), OrchestrationError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestrationError::Interrupted { iteration });
        }

        let size = self.experiment.ensemble_size;
        let mut commands = Vec::with_capacity(size as usize);
        for member in 1..=size {
            let member_dir = self.store.member_dir(iteration, member);
            self.output_reader.clear(&member_dir)?;
            let log_path = self.store.log_path(iteration, member);
            let command =
                self.model
                    .render(self.store.root(), iteration, member, &member_dir, &log_path);
            commands.push((member, command));
        }

        info!(iteration, members = size, "Iteration started");
        let iteration_cancel = self.cancel.child_token();
        let barrier = IterationBarrier::new(
            self.backend.clone(),
            self.retry_policy.clone(),
            self.max_concurrent_polls,
        );
        let run = barrier.run(iteration, commands, iteration_cancel.clone());
        tokio::pin!(run);

        let mut report = match deadline {
            Some(deadline) => {
                let in_time = tokio::select! {
                    report = &mut run => Some(report),
                    _ = tokio::time::sleep_until(deadline) => None,
                };
                match in_time {
                    Some(report) => report,
                    None => {
                        warn!(iteration, "Wall-clock limit reached; cancelling outstanding jobs");
                        iteration_cancel.cancel();
                        // Drain so every member has been cancelled before failing.
                        let _ = run.await;
                        return Err(OrchestrationError::WallClockExpired {
                            iteration,
                            limit: self.wall_clock_limit.unwrap_or_default(),
                        });
                    }
                }
            }
            None => run.await,
        };

        if self.cancel.is_cancelled() {
            return Err(OrchestrationError::Interrupted { iteration });
        }

        let mut outputs = EnsembleOutputMatrix::new(size);
        for member in 1..=size {
            if !report.succeeded(member) {
                continue;
            }
            let member_dir = self.store.member_dir(iteration, member);
            match self.output_reader.read(&member_dir) {
                Ok(values) => outputs.set(member, values),
                Err(e) => {
                    warn!(iteration, member, "Member output unreadable: {}", e);
                    report.mark_exhausted(member, &format!("output unreadable: {e}"));
                }
            }
        }

        self.store.save_report(iteration, &report)?;
        let failed = report.failed_members();
        if !failed.is_empty() {
            if self.failure_policy == FailurePolicy::AbortIteration {
                return Err(OrchestrationError::IterationAborted {
                    iteration,
                    members: failed,
                });
            }
            warn!(
                iteration,
                failed = ?failed,
                "Members exhausted retries; substituting sentinel outputs"
            );
        }

        self.store.save_outputs(iteration, &outputs)?;
        info!(
            iteration,
            succeeded = outputs.successful_count(),
            failed = failed.len(),
            "Iteration outputs persisted"
        );
        Ok((report, outputs))
    }

    async fn update(
        &self,
        iteration: u32,
        state: &OptimizerState,
        outputs: &EnsembleOutputMatrix,
    ) -> Result<UpdateOutcome, OrchestrationError> {
        let result = if outputs.successful_count() == 0 {
            Err(OptimizerError::InvalidInput(format!(
                "every member of iteration {} failed; nothing to update from",
                iteration
            )))
        } else {
            let optimizer = self.optimizer.clone();
            let state = state.clone();
            let outputs = outputs.clone();
            tokio::task::spawn_blocking(move || optimizer.update(&state, &outputs))
                .await
                .unwrap_or_else(|e| {
                    Err(OptimizerError::Collaborator(format!(
                        "update task failed: {e}"
                    )))
                })
        };

        let result = result.and_then(|outcome| {
            let expected = self.experiment.ensemble_size as usize;
            if outcome.state.ensemble.len() != expected {
                return Err(OptimizerError::InvalidInput(format!(
                    "update returned {} members, expected {}",
                    outcome.state.ensemble.len(),
                    expected
                )));
            }
            if let Some((member, col)) = outcome.state.ensemble.first_non_finite() {
                return Err(OptimizerError::InvalidInput(format!(
                    "update returned a non-finite value for member {member} in column {col}"
                )));
            }
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                info!(iteration, terminate = outcome.terminate, "Update step complete");
                Ok(outcome)
            }
            Err(source) => {
                if let Err(e) = self.store.save_failure(iteration, &source.to_string()) {
                    warn!(iteration, "Failed to record update failure: {}", e);
                }
                Err(OrchestrationError::UpdateFailed { iteration, source })
            }
        }
    }

    fn summary_from_completion(
        &self,
        completion: RunCompletion,
    ) -> Result<RunSummary, OrchestrationError> {
        let mut reports = Vec::new();
        for iteration in 0..=completion.final_iteration {
            if let Some(report) = self.store.load_report(iteration)? {
                reports.push(report);
            }
        }
        Ok(RunSummary {
            iterations_run: 0,
            final_iteration: completion.final_iteration,
            terminated_early: completion.terminated_early,
            resumed_from: Some(completion.final_iteration),
            reports,
            final_state: completion.final_state,
        })
    }
}
