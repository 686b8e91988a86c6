//! `calibrate.toml` settings and environment overrides.
//!
//! This is the only place that reads files and environment variables to
//! configure a run; everything downstream receives explicit orchestration
//! types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use orchestration::{
    BackendRule, BackendSettings, ClusterConfig, ExperimentConfig, FailurePolicy,
    LocalPoolConfig, ModelCommand, Prior, RetryPolicy,
};
use serde::Deserialize;
use tracing::warn;

pub const ENV_HOST: &str = "CALIBRATE_HOST";
pub const ENV_OUTPUT_DIR: &str = "CALIBRATE_OUTPUT_DIR";
pub const ENV_MAX_WORKERS: &str = "CALIBRATE_MAX_WORKERS";
pub const ENV_WALL_CLOCK_SECS: &str = "CALIBRATE_WALL_CLOCK_SECS";

/// Top-level `calibrate.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrateSettings {
    pub experiment: ExperimentSection,
    #[serde(default)]
    pub prior: Prior,
    pub model: ModelCommand,
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub iteration_count: u32,
    pub ensemble_size: u32,
    pub observations: Vec<f64>,
    #[serde(default)]
    pub noise: Option<Vec<Vec<f64>>>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub seed: u64,
}

/// External optimizer program speaking JSON over stdin/stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerSection {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub backoff_factor: f64,
    pub max_retry_delay_secs: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    pub max_consecutive_poll_errors: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            retry_delay_secs: policy.retry_delay.as_secs(),
            backoff_factor: policy.backoff_factor,
            max_retry_delay_secs: policy.max_retry_delay.as_secs(),
            poll_interval_ms: policy.poll_interval.as_millis() as u64,
            poll_timeout_secs: policy.poll_timeout.as_secs(),
            max_consecutive_poll_errors: policy.max_consecutive_poll_errors,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub failure_policy: FailurePolicy,
    pub wall_clock_secs: Option<u64>,
    pub max_concurrent_polls: usize,
    /// File each forward model writes its output vector to.
    pub output_file: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            wall_clock_secs: None,
            max_concurrent_polls: orchestration::driver::DEFAULT_POLL_CONCURRENCY,
            output_file: orchestration::JsonOutputReader::DEFAULT_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    /// Host-identity rules, first match wins.
    pub rules: Vec<BackendRule>,
    pub local: LocalSection,
    pub slurm: ClusterSection,
    pub pbs: ClusterSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalSection {
    pub max_workers: Option<usize>,
    /// Kill a local forward model after this many seconds.
    pub job_timeout_secs: Option<u64>,
}

/// Overlay on the flavor's default [`ClusterConfig`]. Unset fields keep the
/// default; `log_sentinel = ""` disables sentinel detection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    pub ssh_host: Option<String>,
    pub submit_command: Option<Vec<String>>,
    pub status_command: Option<Vec<String>>,
    pub history_command: Option<Vec<String>>,
    pub cancel_command: Option<Vec<String>>,
    pub job_id_pattern: Option<String>,
    pub job_name_prefix: Option<String>,
    pub directives: Vec<String>,
    pub preamble: Vec<String>,
    pub log_sentinel: Option<String>,
    pub command_timeout_secs: Option<u64>,
}

impl ClusterSection {
    fn apply(&self, mut config: ClusterConfig) -> ClusterConfig {
        if let Some(host) = &self.ssh_host {
            config.ssh_host = Some(host.clone());
        }
        if let Some(cmd) = &self.submit_command {
            config.submit_command = cmd.clone();
        }
        if let Some(cmd) = &self.status_command {
            config.status_command = cmd.clone();
        }
        if let Some(cmd) = &self.history_command {
            config.history_command = (!cmd.is_empty()).then(|| cmd.clone());
        }
        if let Some(cmd) = &self.cancel_command {
            config.cancel_command = cmd.clone();
        }
        if let Some(pattern) = &self.job_id_pattern {
            config.job_id_pattern = pattern.clone();
        }
        if let Some(prefix) = &self.job_name_prefix {
            config.job_name_prefix = prefix.clone();
        }
        config.directives.extend(self.directives.iter().cloned());
        config.preamble.extend(self.preamble.iter().cloned());
        if let Some(sentinel) = &self.log_sentinel {
            config.log_sentinel = (!sentinel.is_empty()).then(|| sentinel.clone());
        }
        if let Some(secs) = self.command_timeout_secs {
            config.command_timeout = Duration::from_secs(secs);
        }
        config
    }
}

impl CalibrateSettings {
    /// Load a settings file. A relative `output_dir` is resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut settings = Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if settings.experiment.output_dir.is_relative() {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            settings.experiment.output_dir = base.join(&settings.experiment.output_dir);
        }
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }

    /// Reject values that would stall or spin the job lifecycle.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retry;
        ensure!(
            r.poll_timeout_secs > 0,
            "retry.poll_timeout_secs must be positive"
        );
        ensure!(
            r.backoff_factor.is_finite() && r.backoff_factor >= 1.0,
            "retry.backoff_factor must be at least 1.0, got {}",
            r.backoff_factor
        );
        ensure!(
            r.max_consecutive_poll_errors > 0,
            "retry.max_consecutive_poll_errors must be positive"
        );
        ensure!(
            self.backend.local.max_workers != Some(0),
            "backend.local.max_workers must be positive"
        );
        ensure!(
            self.backend.local.job_timeout_secs != Some(0),
            "backend.local.job_timeout_secs must be positive"
        );
        Ok(())
    }

    /// Apply `CALIBRATE_*` overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            self.experiment.output_dir = PathBuf::from(dir);
        }
        if let Some(workers) = parse_var(&lookup, ENV_MAX_WORKERS) {
            self.backend.local.max_workers = Some(workers);
        }
        if let Some(secs) = parse_var(&lookup, ENV_WALL_CLOCK_SECS) {
            self.run.wall_clock_secs = Some(secs);
        }
    }

    pub fn experiment(&self) -> ExperimentConfig {
        let e = &self.experiment;
        ExperimentConfig {
            iteration_count: e.iteration_count,
            ensemble_size: e.ensemble_size,
            observations: e.observations.clone(),
            noise: e.noise.clone(),
            prior: self.prior.clone(),
            output_dir: e.output_dir.clone(),
            seed: e.seed,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.retry;
        RetryPolicy {
            max_retries: r.max_retries,
            retry_delay: Duration::from_secs(r.retry_delay_secs),
            backoff_factor: r.backoff_factor,
            max_retry_delay: Duration::from_secs(r.max_retry_delay_secs),
            poll_interval: Duration::from_millis(r.poll_interval_ms),
            poll_timeout: Duration::from_secs(r.poll_timeout_secs),
            max_consecutive_poll_errors: r.max_consecutive_poll_errors,
        }
    }

    pub fn wall_clock_limit(&self) -> Option<Duration> {
        self.run.wall_clock_secs.map(Duration::from_secs)
    }

    pub fn backend_settings(&self) -> BackendSettings {
        let defaults = LocalPoolConfig::default();
        let local = LocalPoolConfig {
            max_workers: self.backend.local.max_workers.unwrap_or(defaults.max_workers),
            job_timeout: self.backend.local.job_timeout_secs.map(Duration::from_secs),
        };
        BackendSettings {
            local,
            slurm: self.backend.slurm.apply(ClusterConfig::slurm()),
            pbs: self.backend.pbs.apply(ClusterConfig::pbs()),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

/// Host identity used for backend resolution.
///
/// Precedence: `--host`, `CALIBRATE_HOST`, `HOSTNAME`, `/etc/hostname`,
/// then `localhost`.
pub fn host_identity<F>(cli_host: Option<&str>, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    cli_host
        .map(str::to_string)
        .or_else(|| lookup(ENV_HOST))
        .or_else(|| lookup("HOSTNAME"))
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::BackendDescriptor;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [experiment]
        iteration_count = 3
        ensemble_size = 5
        observations = [1.0, 2.0]
        output_dir = "runs/exp"

        [model]
        program = "/opt/model/run.sh"

        [optimizer]
        program = "/opt/enkf/update"
    "#;

    #[test]
    fn test_minimal_settings_use_defaults() {
        let settings = CalibrateSettings::from_toml(MINIMAL).unwrap();
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.run.failure_policy, FailurePolicy::ContinueWithSentinel);
        assert!(settings.wall_clock_limit().is_none());
        assert!(settings.backend.rules.is_empty());
        let backends = settings.backend_settings();
        assert_eq!(backends.slurm, ClusterConfig::slurm());
        assert_eq!(backends.pbs, ClusterConfig::pbs());
    }

    #[test]
    fn test_full_settings() {
        let raw = r#"
            [experiment]
            iteration_count = 4
            ensemble_size = 20
            observations = [0.5]
            noise = [[0.01]]
            output_dir = "/scratch/exp"
            seed = 11

            [prior]
            parameter_names = ["k", "phi"]
            spec = { k = { dist = "normal", mean = 1.0 } }

            [model]
            program = "calibrate"
            args = ["run-member", "--", "{member_dir}/parameters.json"]
            interface = "/opt/model/run.sh"

            [optimizer]
            program = "/opt/enkf/update"
            args = ["--inflation", "1.1"]

            [retry]
            max_retries = 1
            poll_interval_ms = 500

            [run]
            failure_policy = "abort_iteration"
            wall_clock_secs = 3600

            [[backend.rules]]
            pattern = '^login\d+\.alpha\.'
            backend = "slurm"

            [backend.slurm]
            ssh_host = "login1.alpha.example.org"
            directives = ["--time=01:00:00"]
            log_sentinel = ""
            command_timeout_secs = 10
        "#;
        let settings = CalibrateSettings::from_toml(raw).unwrap();
        let experiment = settings.experiment();
        assert_eq!(experiment.prior.parameter_names, vec!["k", "phi"]);
        assert_eq!(experiment.prior.spec["k"]["dist"], "normal");
        assert!(experiment.validate().is_ok());

        let policy = settings.retry_policy();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.run.failure_policy, FailurePolicy::AbortIteration);
        assert_eq!(settings.wall_clock_limit(), Some(Duration::from_secs(3600)));
        assert_eq!(settings.backend.rules[0].backend, BackendDescriptor::Slurm);

        let slurm = settings.backend_settings().slurm;
        assert_eq!(slurm.ssh_host.as_deref(), Some("login1.alpha.example.org"));
        assert_eq!(slurm.directives, vec!["--time=01:00:00"]);
        assert_eq!(slurm.log_sentinel, None);
        assert_eq!(slurm.command_timeout, Duration::from_secs(10));
        assert_eq!(slurm.submit_command, vec!["sbatch", "--parsable"]);
        assert_eq!(
            settings.model.model_interface(),
            Path::new("/opt/model/run.sh")
        );
    }

    #[test]
    fn test_degenerate_retry_values_are_rejected() {
        for (section, field) in [
            ("[retry]\npoll_timeout_secs = 0\n", "poll_timeout_secs"),
            ("[retry]\nbackoff_factor = 0.5\n", "backoff_factor"),
            ("[retry]\nmax_consecutive_poll_errors = 0\n", "max_consecutive_poll_errors"),
            ("[backend.local]\njob_timeout_secs = 0\n", "job_timeout_secs"),
        ] {
            let raw = format!("{MINIMAL}\n{section}");
            let err = CalibrateSettings::from_toml(&raw).unwrap_err();
            assert!(format!("{err:#}").contains(field), "{err:#}");
        }
    }

    #[test]
    fn test_load_reports_invalid_values_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrate.toml");
        std::fs::write(&path, format!("{MINIMAL}\n[retry]\nbackoff_factor = 0.0\n")).unwrap();

        let err = CalibrateSettings::load(&path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("calibrate.toml"));
        assert!(message.contains("backoff_factor"));
    }

    #[test]
    fn test_local_job_timeout() {
        let raw = format!("{MINIMAL}\n[backend.local]\nmax_workers = 2\njob_timeout_secs = 90\n");
        let local = CalibrateSettings::from_toml(&raw).unwrap().backend_settings().local;
        assert_eq!(local.max_workers, 2);
        assert_eq!(local.job_timeout, Some(Duration::from_secs(90)));
        let local = CalibrateSettings::from_toml(MINIMAL).unwrap().backend_settings().local;
        assert_eq!(local.job_timeout, None);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let raw = format!("{MINIMAL}\n[run]\nwall_clock = 5\n");
        assert!(CalibrateSettings::from_toml(&raw).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = CalibrateSettings::from_toml(MINIMAL).unwrap();
        let vars: HashMap<&str, &str> = [
            (ENV_OUTPUT_DIR, "/scratch/override"),
            (ENV_MAX_WORKERS, "3"),
            (ENV_WALL_CLOCK_SECS, "not-a-number"),
        ]
        .into_iter()
        .collect();
        settings.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(
            settings.experiment.output_dir,
            PathBuf::from("/scratch/override")
        );
        assert_eq!(settings.backend_settings().local.max_workers, 3);
        assert!(settings.wall_clock_limit().is_none());
    }

    #[test]
    fn test_load_resolves_relative_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrate.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let settings = CalibrateSettings::load(&path).unwrap();
        assert_eq!(settings.experiment.output_dir, dir.path().join("runs/exp"));
    }

    #[test]
    fn test_host_identity_precedence() {
        let vars: HashMap<&str, &str> =
            [(ENV_HOST, "login2.alpha"), ("HOSTNAME", "node7")].into_iter().collect();
        let lookup = |k: &str| vars.get(k).map(|v| v.to_string());

        assert_eq!(host_identity(Some("cli-host"), lookup), "cli-host");
        assert_eq!(host_identity(None, lookup), "login2.alpha");
        assert_eq!(
            host_identity(None, |k| (k == "HOSTNAME").then(|| "node7\n".to_string())),
            "node7"
        );
    }
}
