//! Execution backends behind a uniform submit/poll/cancel contract.
//!
//! ```text
//! BackendClient (trait seam, also implemented by test doubles)
//!   └─ Backend (tagged variant, dispatch by match)
//!        ├─ LocalPool → local::LocalPoolBackend   (worker-bounded local processes)
//!        └─ Cluster   → cluster::ClusterBackend   (Slurm | PBS batch scheduler)
//! ```
//!
//! Contracts every implementation honors:
//! - `submit` is called once per attempt; a retry submits again and gets a
//!   fresh [`RemoteJobId`].
//! - `poll` is safe to call repeatedly and is bounded in time.
//! - `cancel` is best-effort and returns `Ok` for terminal or unknown jobs.

pub mod cluster;
pub mod local;
pub mod resolve;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, OrchestrationError};
use crate::lifecycle::MemberJob;

use cluster::{ClusterBackend, ClusterConfig};
use local::{LocalPoolBackend, LocalPoolConfig};

/// Identifier a backend hands out for one submitted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobId(pub String);

impl RemoteJobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Queued or executing; keep polling.
    Running,
    Succeeded,
    Failed { reason: String },
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A fully rendered forward-model invocation for one member attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// The member directory; the job runs here.
    pub working_dir: PathBuf,
    /// Run log (stdout and stderr) inside the member directory.
    pub log_path: PathBuf,
}

impl RenderedCommand {
    /// Shell-quoted `program args...` line for submission scripts.
    pub fn shell_line(&self) -> Result<String, BackendError> {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote(&self.program.to_string_lossy())?);
        for arg in &self.args {
            parts.push(quote(arg)?);
        }
        Ok(parts.join(" "))
    }
}

pub(crate) fn quote(raw: &str) -> Result<String, BackendError> {
    shlex::try_quote(raw)
        .map(|q| q.into_owned())
        .map_err(|e| BackendError::Parse(format!("cannot quote {raw:?}: {e}")))
}

/// Start a fresh run log for `attempt`, keeping the previous attempt's log
/// as `model_log.txt.<n>` so completion detection only sees this attempt.
pub(crate) fn prepare_log(log_path: &Path, attempt: u32) -> Result<(), BackendError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !log_path.exists() {
        return Ok(());
    }
    if attempt > 1 {
        let mut rotated = log_path.as_os_str().to_owned();
        rotated.push(format!(".{}", attempt - 1));
        std::fs::rename(log_path, PathBuf::from(rotated))?;
    } else {
        std::fs::remove_file(log_path)?;
    }
    Ok(())
}

/// Submit/poll/cancel capability set of an execution backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    async fn submit(
        &self,
        job: &MemberJob,
        command: &RenderedCommand,
    ) -> Result<RemoteJobId, BackendError>;

    async fn poll(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError>;

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), BackendError>;
}

/// Which execution backend a process uses, resolved once from host identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendDescriptor {
    #[default]
    LocalPool,
    Slurm,
    Pbs,
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalPool => write!(f, "local_pool"),
            Self::Slurm => write!(f, "slurm"),
            Self::Pbs => write!(f, "pbs"),
        }
    }
}

/// Per-variant backend settings; only the resolved variant's entry is used.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub local: LocalPoolConfig,
    pub slurm: ClusterConfig,
    pub pbs: ClusterConfig,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            local: LocalPoolConfig::default(),
            slurm: ClusterConfig::slurm(),
            pbs: ClusterConfig::pbs(),
        }
    }
}

/// Concrete backend selected for the run.
pub enum Backend {
    LocalPool(LocalPoolBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    pub fn from_descriptor(
        descriptor: BackendDescriptor,
        settings: &BackendSettings,
    ) -> Result<Self, OrchestrationError> {
        let backend = match descriptor {
            BackendDescriptor::LocalPool => {
                Self::LocalPool(LocalPoolBackend::new(settings.local.clone()))
            }
            BackendDescriptor::Slurm => Self::Cluster(
                ClusterBackend::new(settings.slurm.clone())
                    .map_err(|e| OrchestrationError::Configuration(e.to_string()))?,
            ),
            BackendDescriptor::Pbs => Self::Cluster(
                ClusterBackend::new(settings.pbs.clone())
                    .map_err(|e| OrchestrationError::Configuration(e.to_string()))?,
            ),
        };
        tracing::info!(backend = %descriptor, "Execution backend selected");
        Ok(backend)
    }
}

#[async_trait]
impl BackendClient for Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::LocalPool(b) => b.name(),
            Self::Cluster(b) => b.name(),
        }
    }

    async fn submit(
        &self,
        job: &MemberJob,
        command: &RenderedCommand,
    ) -> Result<RemoteJobId, BackendError> {
        match self {
            Self::LocalPool(b) => b.submit(job, command).await,
            Self::Cluster(b) => b.submit(job, command).await,
        }
    }

    async fn poll(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
        match self {
            Self::LocalPool(b) => b.poll(id).await,
            Self::Cluster(b) => b.poll(id).await,
        }
    }

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), BackendError> {
        match self {
            Self::LocalPool(b) => b.cancel(id).await,
            Self::Cluster(b) => b.cancel(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_line_quotes_arguments() {
        let cmd = RenderedCommand {
            program: PathBuf::from("/opt/my model/run.sh"),
            args: vec!["--name".into(), "it's".into(), "plain".into()],
            env: vec![],
            working_dir: PathBuf::from("/tmp"),
            log_path: PathBuf::from("/tmp/model_log.txt"),
        };
        let line = cmd.shell_line().unwrap();
        assert!(line.ends_with(" plain"));
        assert_eq!(
            shlex::split(&line).unwrap(),
            vec!["/opt/my model/run.sh", "--name", "it's", "plain"]
        );
    }

    #[test]
    fn test_prepare_log_rotates_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("member_001").join("model_log.txt");

        // Missing parent and log are fine.
        prepare_log(&log, 1).unwrap();
        assert!(log.parent().unwrap().is_dir());

        std::fs::write(&log, "attempt one\n").unwrap();
        prepare_log(&log, 2).unwrap();
        assert!(!log.exists());
        let rotated = dir.path().join("member_001").join("model_log.txt.1");
        assert_eq!(std::fs::read_to_string(rotated).unwrap(), "attempt one\n");

        // First attempt of a re-run drops the stale log.
        std::fs::write(&log, "stale\n").unwrap();
        prepare_log(&log, 1).unwrap();
        assert!(!log.exists());
    }

    #[test]
    fn test_descriptor_display() {
        assert_eq!(BackendDescriptor::default(), BackendDescriptor::LocalPool);
        assert_eq!(BackendDescriptor::Pbs.to_string(), "pbs");
    }
}
