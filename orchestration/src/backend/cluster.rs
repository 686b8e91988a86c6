//! Cluster batch backend for Slurm-like and PBS-like schedulers.
//!
//! Per attempt the backend renders `submit.sh` into the member directory,
//! hands it to the scheduler's submit command and extracts the job id from
//! its output. Completion is detected from scheduler state and, when a
//! sentinel is configured, from the sentinel line the script appends to the
//! run log on success. Every scheduler command is bounded by
//! `command_timeout` and may be routed through `ssh` to a login host.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{prepare_log, quote, BackendClient, PollStatus, RemoteJobId, RenderedCommand};
use crate::error::BackendError;
use crate::lifecycle::MemberJob;

/// Default line appended to the run log when the forward model exits 0.
pub const DEFAULT_SENTINEL: &str = "CALIBRATE_MEMBER_COMPLETE";

/// Batch scheduler dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerFlavor {
    Slurm,
    Pbs,
}

impl fmt::Display for SchedulerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slurm => write!(f, "slurm"),
            Self::Pbs => write!(f, "pbs"),
        }
    }
}

/// Scheduler-reported job state, normalized across flavors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchedulerState {
    Pending,
    Configuring,
    Running,
    Completing,
    Suspended,
    Preempted,
    Requeued,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    OutOfMemory,
    BootFail,
    Deadline,
    Unknown,
}

impl From<&str> for SchedulerState {
    fn from(s: &str) -> Self {
        // sacct reports e.g. "CANCELLED by 1234"
        let token = s.split_whitespace().next().unwrap_or("");
        match token.to_uppercase().trim_end_matches('+') {
            "PENDING" | "PD" => Self::Pending,
            "CONFIGURING" | "CF" => Self::Configuring,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "SUSPENDED" | "S" => Self::Suspended,
            "PREEMPTED" | "PR" => Self::Preempted,
            "REQUEUED" | "RQ" | "REQUEUE_HOLD" | "REQUEUE_FED" => Self::Requeued,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "BOOT_FAIL" | "BF" => Self::BootFail,
            "DEADLINE" | "DL" => Self::Deadline,
            _ => Self::Unknown,
        }
    }
}

impl SchedulerState {
    /// Still queued or executing (a preempted job is requeued by the scheduler).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Configuring
                | Self::Running
                | Self::Completing
                | Self::Suspended
                | Self::Preempted
                | Self::Requeued
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::BootFail
                | Self::Deadline
        )
    }
}

/// Configuration for one cluster backend.
///
/// Commands are argv prefixes: the backend appends its own arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub flavor: SchedulerFlavor,
    /// Run scheduler commands as `ssh HOST '<cmd>'` (None = run locally).
    pub ssh_host: Option<String>,
    pub submit_command: Vec<String>,
    pub status_command: Vec<String>,
    /// Accounting query for jobs that left the queue (Slurm `sacct`).
    pub history_command: Option<Vec<String>>,
    pub cancel_command: Vec<String>,
    /// Regex with one capture group extracting the id from submit output.
    pub job_id_pattern: String,
    pub job_name_prefix: String,
    /// Verbatim scheduler directives, e.g. `--time=02:00:00` / `-l walltime=02:00:00`.
    pub directives: Vec<String>,
    /// Verbatim shell lines run before the model (module loads, env setup).
    pub preamble: Vec<String>,
    /// Completion sentinel written to the run log on success.
    pub log_sentinel: Option<String>,
    /// Bound on every scheduler command.
    pub command_timeout: Duration,
}

impl ClusterConfig {
    pub fn slurm() -> Self {
        Self {
            flavor: SchedulerFlavor::Slurm,
            ssh_host: None,
            submit_command: vec!["sbatch".into(), "--parsable".into()],
            status_command: vec!["squeue".into()],
            history_command: Some(vec!["sacct".into()]),
            cancel_command: vec!["scancel".into()],
            job_id_pattern: r"^\s*(\d+)".into(),
            job_name_prefix: "calib".into(),
            directives: Vec::new(),
            preamble: Vec::new(),
            log_sentinel: Some(DEFAULT_SENTINEL.into()),
            command_timeout: Duration::from_secs(30),
        }
    }

    pub fn pbs() -> Self {
        Self {
            flavor: SchedulerFlavor::Pbs,
            ssh_host: None,
            submit_command: vec!["qsub".into()],
            status_command: vec!["qstat".into()],
            history_command: None,
            cancel_command: vec!["qdel".into()],
            job_id_pattern: r"^\s*(\S+)".into(),
            job_name_prefix: "calib".into(),
            directives: Vec::new(),
            preamble: Vec::new(),
            log_sentinel: Some(DEFAULT_SENTINEL.into()),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Submits one batch job per member attempt to an external scheduler.
pub struct ClusterBackend {
    config: ClusterConfig,
    job_id_regex: Regex,
    /// Run log per submitted job, for sentinel detection.
    logs: Mutex<HashMap<RemoteJobId, PathBuf>>,
}

impl ClusterBackend {
    pub fn new(config: ClusterConfig) -> Result<Self, BackendError> {
        let job_id_regex = Regex::new(&config.job_id_pattern).map_err(|e| {
            BackendError::Parse(format!(
                "invalid job id pattern {:?}: {}",
                config.job_id_pattern, e
            ))
        })?;
        if job_id_regex.captures_len() < 2 {
            return Err(BackendError::Parse(format!(
                "job id pattern {:?} needs a capture group",
                config.job_id_pattern
            )));
        }
        if config.submit_command.is_empty()
            || config.status_command.is_empty()
            || config.cancel_command.is_empty()
        {
            return Err(BackendError::Parse(
                "scheduler commands must not be empty".into(),
            ));
        }
        Ok(Self {
            config,
            job_id_regex,
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn job_name(&self, job: &MemberJob) -> String {
        format!(
            "{}-i{:03}-m{:03}",
            self.config.job_name_prefix,
            job.iteration(),
            job.member()
        )
    }

    /// Render the submission script for one attempt.
    pub fn render_script(
        &self,
        job: &MemberJob,
        command: &RenderedCommand,
    ) -> Result<String, BackendError> {
        let log = command.log_path.to_string_lossy();
        let name = self.job_name(job);
        let mut lines = vec!["#!/bin/bash".to_string()];

        match self.config.flavor {
            SchedulerFlavor::Slurm => {
                lines.push(format!("#SBATCH --job-name={name}"));
                lines.push(format!("#SBATCH --output={log}"));
                lines.push(format!("#SBATCH --error={log}"));
                lines.push("#SBATCH --open-mode=append".to_string());
                for d in &self.config.directives {
                    lines.push(format!("#SBATCH {d}"));
                }
            }
            SchedulerFlavor::Pbs => {
                lines.push(format!("#PBS -N {name}"));
                lines.push(format!("#PBS -o {log}"));
                lines.push("#PBS -j oe".to_string());
                for d in &self.config.directives {
                    lines.push(format!("#PBS {d}"));
                }
            }
        }

        lines.push(String::new());
        lines.extend(self.config.preamble.iter().cloned());
        lines.push(format!(
            "cd {} || exit 1",
            quote(&command.working_dir.to_string_lossy())?
        ));
        for (key, value) in &command.env {
            lines.push(format!("export {}={}", key, quote(value)?));
        }
        lines.push(command.shell_line()?);
        lines.push("status=$?".to_string());
        if let Some(sentinel) = &self.config.log_sentinel {
            lines.push("if [ \"$status\" -eq 0 ]; then".to_string());
            lines.push(format!("  echo {}", quote(sentinel)?));
            lines.push("fi".to_string());
        }
        lines.push("exit \"$status\"".to_string());
        lines.push(String::new());

        Ok(lines.join("\n"))
    }

    /// Extract the scheduler job id from submit output.
    pub fn parse_job_id(&self, stdout: &str) -> Result<RemoteJobId, BackendError> {
        self.job_id_regex
            .captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| RemoteJobId(m.as_str().to_string()))
            .ok_or_else(|| {
                BackendError::Parse(format!("Failed to parse job ID from: {}", stdout.trim()))
            })
    }

    /// Run a scheduler command, optionally via SSH to the login host.
    async fn run_scheduler_cmd(
        &self,
        base: &[String],
        args: &[String],
    ) -> Result<Output, BackendError> {
        let (program, prefix) = base
            .split_first()
            .ok_or_else(|| BackendError::CommandFailed("empty scheduler command".into()))?;

        let mut cmd = if let Some(host) = &self.config.ssh_host {
            let remote = base
                .iter()
                .chain(args)
                .map(|part| quote(part))
                .collect::<Result<Vec<_>, _>>()?
                .join(" ");
            let mut cmd = Command::new("ssh");
            cmd.args([host.as_str(), remote.as_str()]);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(prefix).args(args);
            cmd
        };
        cmd.kill_on_drop(true);

        let timeout = self.config.command_timeout;
        tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(BackendError::Io)
    }

    fn stdout_of(output: &Output) -> Result<String, BackendError> {
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(BackendError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn log_path(&self, id: &RemoteJobId) -> Option<PathBuf> {
        self.logs.lock().ok()?.get(id).cloned()
    }

    fn forget(&self, id: &RemoteJobId) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.remove(id);
        }
    }

    /// Jobs whose run log is still tracked.
    pub fn tracked_jobs(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or(0)
    }

    async fn sentinel_seen(&self, log_path: Option<&Path>) -> bool {
        let (Some(sentinel), Some(path)) = (&self.config.log_sentinel, log_path) else {
            return false;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => content.lines().any(|l| l.trim() == sentinel),
            Err(_) => false,
        }
    }

    /// Scheduler state while queued, falling back to accounting history.
    async fn slurm_state(&self, id: &RemoteJobId) -> Result<Option<SchedulerState>, BackendError> {
        let args: Vec<String> = ["-h", "-j", id.as_str(), "-o", "%T"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .run_scheduler_cmd(&self.config.status_command, &args)
            .await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(Some(SchedulerState::from(line)));
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !left_queue(&stderr) {
                return Err(BackendError::CommandFailed(stderr.trim().to_string()));
            }
        }

        let Some(history) = &self.config.history_command else {
            return Ok(None);
        };
        let args: Vec<String> = ["-n", "-P", "-X", "-j", id.as_str(), "-o", "State"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.run_scheduler_cmd(history, &args).await?;
        let stdout = Self::stdout_of(&output)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(SchedulerState::from))
    }

    async fn poll_slurm(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
        let log = self.log_path(id);
        let state = self.slurm_state(id).await?;
        debug!(job_id = %id, ?state, "Slurm job state");

        match state {
            Some(s) if s.is_active() => Ok(PollStatus::Running),
            Some(SchedulerState::Completed) => {
                if self.config.log_sentinel.is_some() && !self.sentinel_seen(log.as_deref()).await
                {
                    Ok(PollStatus::Failed {
                        reason: "job completed without completion sentinel in log".into(),
                    })
                } else {
                    Ok(PollStatus::Succeeded)
                }
            }
            Some(s) if s.is_failure() => Ok(PollStatus::Failed {
                reason: format!("scheduler reported {:?}", s),
            }),
            Some(_) => Err(BackendError::Parse(format!(
                "unrecognized scheduler state for job {id}"
            ))),
            None => self.decide_from_log(id, log.as_deref()).await,
        }
    }

    async fn poll_pbs(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
        let log = self.log_path(id);
        let args = vec!["-x".to_string(), "-f".to_string(), id.to_string()];
        let output = self
            .run_scheduler_cmd(&self.config.status_command, &args)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if left_queue(&stderr) {
                return self.decide_from_log(id, log.as_deref()).await;
            }
            return Err(BackendError::CommandFailed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (state, exit_status) = parse_qstat(&stdout);
        debug!(job_id = %id, ?state, ?exit_status, "PBS job state");

        match state.as_deref() {
            Some("Q" | "H" | "W" | "R" | "E" | "T" | "S" | "B" | "M" | "U") => {
                Ok(PollStatus::Running)
            }
            Some("F" | "C") => match exit_status {
                Some(0) => {
                    if self.config.log_sentinel.is_some()
                        && !self.sentinel_seen(log.as_deref()).await
                    {
                        Ok(PollStatus::Failed {
                            reason: "job finished without completion sentinel in log".into(),
                        })
                    } else {
                        Ok(PollStatus::Succeeded)
                    }
                }
                Some(code) => Ok(PollStatus::Failed {
                    reason: format!("job exited with status {code}"),
                }),
                None => self.decide_from_log(id, log.as_deref()).await,
            },
            Some(other) => Err(BackendError::Parse(format!(
                "unrecognized PBS job_state {other:?} for job {id}"
            ))),
            None => Err(BackendError::Parse(format!(
                "qstat output for job {id} has no job_state"
            ))),
        }
    }

    /// The scheduler no longer knows the job: the log sentinel decides.
    async fn decide_from_log(
        &self,
        id: &RemoteJobId,
        log: Option<&Path>,
    ) -> Result<PollStatus, BackendError> {
        if self.config.log_sentinel.is_none() {
            return Err(BackendError::UnknownJob(id.to_string()));
        }
        if self.sentinel_seen(log).await {
            Ok(PollStatus::Succeeded)
        } else {
            Ok(PollStatus::Failed {
                reason: "job left the scheduler without completion sentinel in log".into(),
            })
        }
    }
}

/// Pull `job_state` and `Exit_status` out of `qstat -f` output.
fn parse_qstat(stdout: &str) -> (Option<String>, Option<i32>) {
    let mut state = None;
    let mut exit_status = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "job_state" => state = Some(value.trim().to_string()),
            "Exit_status" => exit_status = value.trim().parse().ok(),
            _ => {}
        }
    }
    (state, exit_status)
}

/// Status errors that mean the scheduler no longer knows the job.
fn left_queue(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("invalid job id") || lower.contains("unknown job id")
}

/// Cancel errors that just mean the job is already gone.
fn is_already_terminal(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "invalid job id",
        "already completing or completed",
        "unknown job id",
        "job has finished",
        "invalid state for job",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[async_trait]
impl BackendClient for ClusterBackend {
    fn name(&self) -> &'static str {
        match self.config.flavor {
            SchedulerFlavor::Slurm => "slurm",
            SchedulerFlavor::Pbs => "pbs",
        }
    }

    async fn submit(
        &self,
        job: &MemberJob,
        command: &RenderedCommand,
    ) -> Result<RemoteJobId, BackendError> {
        prepare_log(&command.log_path, job.attempt())?;
        let script = self.render_script(job, command)?;
        let script_path = command.working_dir.join("submit.sh");
        tokio::fs::write(&script_path, script).await?;

        let output = self
            .run_scheduler_cmd(
                &self.config.submit_command,
                &[script_path.to_string_lossy().into_owned()],
            )
            .await?;
        let stdout = Self::stdout_of(&output).map_err(|e| BackendError::Submit(e.to_string()))?;
        let id = self.parse_job_id(&stdout)?;

        if let Ok(mut logs) = self.logs.lock() {
            logs.insert(id.clone(), command.log_path.clone());
        }
        info!(
            iteration = job.iteration(),
            member = job.member(),
            attempt = job.attempt(),
            job_id = %id,
            "Submitted {} job",
            self.config.flavor
        );
        Ok(id)
    }

    async fn poll(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
        let status = match self.config.flavor {
            SchedulerFlavor::Slurm => self.poll_slurm(id).await?,
            SchedulerFlavor::Pbs => self.poll_pbs(id).await?,
        };
        if status.is_terminal() {
            self.forget(id);
        }
        Ok(status)
    }

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), BackendError> {
        let output = self
            .run_scheduler_cmd(&self.config.cancel_command, &[id.to_string()])
            .await?;
        if output.status.success() {
            self.forget(id);
            info!(job_id = %id, "Cancelled job");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_terminal(&stderr) {
            self.forget(id);
            debug!(job_id = %id, "Cancel ignored: job already terminal");
            Ok(())
        } else {
            warn!(job_id = %id, "Cancel failed: {}", stderr.trim());
            Err(BackendError::CommandFailed(stderr.trim().to_string()))
        }
    }
}
