//! Wiring from settings to a runnable driver, plus the `status` query.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestration::{
    Backend, BackendDescriptor, BackendResolver, CalibrationDriver, Checkpoint, CheckpointStore,
    JsonOutputReader, RunCompletion,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::external_optimizer::CommandOptimizer;
use crate::settings::CalibrateSettings;

/// Build the driver for a run on `host`.
///
/// The backend is resolved once here and never re-resolved mid-run.
pub fn build_driver(
    settings: &CalibrateSettings,
    host: &str,
    cancel: CancellationToken,
) -> Result<CalibrationDriver> {
    let descriptor = resolve_backend(settings, host)?;
    let backend = Backend::from_descriptor(descriptor, &settings.backend_settings())?;

    let experiment = settings.experiment();
    let optimizer = CommandOptimizer::new(
        settings.optimizer.program.clone(),
        settings.optimizer.args.clone(),
    )
    .with_observations(experiment.observations.clone(), experiment.noise.clone());

    info!(
        host,
        backend = %descriptor,
        output_dir = %experiment.output_dir.display(),
        iterations = experiment.iteration_count,
        ensemble_size = experiment.ensemble_size,
        "Preparing calibration run"
    );

    let driver = CalibrationDriver::new(
        experiment,
        Arc::new(backend),
        Arc::new(optimizer),
        settings.model.clone(),
    )?
    .with_retry_policy(settings.retry_policy())
    .with_failure_policy(settings.run.failure_policy)
    .with_wall_clock_limit(settings.wall_clock_limit())
    .with_output_reader(Arc::new(JsonOutputReader::new(
        settings.run.output_file.clone(),
    )))
    .with_poll_concurrency(settings.run.max_concurrent_polls)
    .with_cancellation(cancel);

    Ok(driver)
}

pub fn resolve_backend(settings: &CalibrateSettings, host: &str) -> Result<BackendDescriptor> {
    let resolver = BackendResolver::new(&settings.backend.rules)?;
    Ok(resolver.resolve(host))
}

/// Snapshot of a run's on-disk progress.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub iteration_count: u32,
    pub latest: Option<Checkpoint>,
    pub completion: Option<RunCompletion>,
    /// Members that did not succeed in the latest iteration with a report.
    pub failed_members: Vec<u32>,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(done) = &self.completion {
            let how = if done.terminated_early {
                "terminated early"
            } else {
                "completed"
            };
            return write!(
                f,
                "Run {} at iteration {:03}/{:03} ({})",
                how,
                done.final_iteration,
                self.iteration_count.saturating_sub(1),
                done.completed_at.to_rfc3339()
            );
        }
        match &self.latest {
            None => write!(f, "No checkpoint yet; the run has not started"),
            Some(cp) => {
                let phase = if cp.has_outputs {
                    "outputs collected, update pending"
                } else {
                    "ready to run"
                };
                write!(
                    f,
                    "Latest checkpoint: iteration {:03}/{:03} ({})",
                    cp.iteration,
                    self.iteration_count.saturating_sub(1),
                    phase
                )?;
                if !self.failed_members.is_empty() {
                    write!(f, "; failed members: {:?}", self.failed_members)?;
                }
                Ok(())
            }
        }
    }
}

pub fn status(settings: &CalibrateSettings) -> Result<RunStatus> {
    let store = CheckpointStore::new(settings.experiment.output_dir.clone());
    let completion = store
        .completion()
        .context("Failed to read the completion marker")?;
    let latest = store
        .latest_checkpoint()
        .context("Failed to scan checkpoints")?;

    let failed_members = match latest {
        Some(cp) if cp.has_outputs => store
            .load_report(cp.iteration)
            .context("Failed to read the barrier report")?
            .map(|report| report.failed_members())
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    Ok(RunStatus {
        iteration_count: settings.experiment.iteration_count,
        latest,
        completion,
        failed_members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::{OptimizerState, ParameterMatrix};

    fn settings(output_dir: &std::path::Path) -> CalibrateSettings {
        let raw = format!(
            r#"
            [experiment]
            iteration_count = 4
            ensemble_size = 2
            observations = [1.0]
            output_dir = {:?}

            [model]
            program = "/bin/true"

            [optimizer]
            program = "/bin/true"

            [[backend.rules]]
            pattern = "^login\\d+\\.hpc"
            backend = "slurm"
            "#,
            output_dir.to_string_lossy()
        );
        CalibrateSettings::from_toml(&raw).unwrap()
    }

    fn state() -> OptimizerState {
        OptimizerState::initial(ParameterMatrix::new(vec![vec![1.0], vec![2.0]]))
    }

    #[test]
    fn test_backend_resolution_uses_rules() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        assert_eq!(
            resolve_backend(&settings, "login2.hpc.example.org").unwrap(),
            BackendDescriptor::Slurm
        );
        assert_eq!(
            resolve_backend(&settings, "laptop").unwrap(),
            BackendDescriptor::LocalPool
        );
    }

    #[test]
    fn test_build_driver_validates_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.experiment.ensemble_size = 0;
        let err = build_driver(&settings, "laptop", CancellationToken::new()).err().expect("expected build_driver to fail");
        assert!(err.to_string().contains("ensemble_size"));
    }

    #[test]
    fn test_status_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let status = status(&settings(&dir.path().join("missing"))).unwrap();
        assert!(status.latest.is_none());
        assert!(status.completion.is_none());
        assert!(status.to_string().contains("has not started"));
    }

    #[test]
    fn test_status_reports_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let store = CheckpointStore::new(dir.path());
        store.save_state(0, &state(), &settings.prior).unwrap();
        store.save_state(1, &state(), &settings.prior).unwrap();

        let status = status(&settings).unwrap();
        assert_eq!(status.latest.map(|cp| cp.iteration), Some(1));
        assert_eq!(
            status.to_string(),
            "Latest checkpoint: iteration 001/003 (ready to run)"
        );
    }

    #[test]
    fn test_status_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let store = CheckpointStore::new(dir.path());
        store.save_state(0, &state(), &settings.prior).unwrap();
        store
            .mark_complete(&RunCompletion {
                final_iteration: 1,
                terminated_early: true,
                completed_at: chrono::Utc::now(),
                final_state: state(),
            })
            .unwrap();

        let status = status(&settings).unwrap();
        assert!(status
            .to_string()
            .starts_with("Run terminated early at iteration 001/003"));
    }
}
