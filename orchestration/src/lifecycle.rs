//! Per-member job lifecycle: submit, poll, retry, exhaust.
//!
//! Each ensemble member of an iteration gets one [`MemberJob`] whose status
//! moves through a guarded state graph:
//!
//! ```text
//! Pending         → Submitted | FailedRetryable | FailedExhausted
//! Submitted       → Running | Succeeded | FailedRetryable | FailedExhausted
//! Running         → Succeeded | FailedRetryable | FailedExhausted
//! FailedRetryable → Pending | FailedExhausted
//! ```
//!
//! `Succeeded` and `FailedExhausted` are terminal. Every transition is
//! recorded with the attempt it belongs to, so the per-member history can be
//! persisted in the iteration report.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, PollStatus, RemoteJobId, RenderedCommand};
use crate::config::RetryPolicy;
use crate::error::BackendError;

/// Member job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    FailedRetryable,
    FailedExhausted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedExhausted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::FailedRetryable => write!(f, "FailedRetryable"),
            Self::FailedExhausted => write!(f, "FailedExhausted"),
        }
    }
}

fn is_legal_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    // Any non-terminal status can give up.
    if to == FailedExhausted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Submitted)
            | (Pending, FailedRetryable)
            | (Submitted, Running)
            | (Submitted, Succeeded)
            | (Submitted, FailedRetryable)
            | (Running, Succeeded)
            | (Running, FailedRetryable)
            | (FailedRetryable, Pending)
    )
}

/// A single recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when a status change would leave the state graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalJobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl fmt::Display for IllegalJobTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal job transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalJobTransition {}

/// One ensemble member's job within one iteration.
#[derive(Debug, Clone)]
pub struct MemberJob {
    iteration: u32,
    member: u32,
    attempt: u32,
    status: JobStatus,
    remote_id: Option<RemoteJobId>,
    last_error: Option<String>,
    transitions: Vec<JobTransition>,
}

impl MemberJob {
    /// A fresh job in `Pending` with no attempts made.
    pub fn new(iteration: u32, member: u32) -> Self {
        Self {
            iteration,
            member,
            attempt: 0,
            status: JobStatus::Pending,
            remote_id: None,
            last_error: None,
            transitions: Vec::new(),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn member(&self) -> u32 {
        self.member
    }

    /// 1-based attempt number of the current (or last) submission; 0 before
    /// the first submission.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn remote_id(&self) -> Option<&RemoteJobId> {
        self.remote_id.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transitions(&self) -> &[JobTransition] {
        &self.transitions
    }

    /// Move to `to`, recording the transition.
    pub fn advance(
        &mut self,
        to: JobStatus,
        reason: Option<&str>,
    ) -> Result<(), IllegalJobTransition> {
        if !is_legal_transition(self.status, to) {
            return Err(IllegalJobTransition {
                from: self.status,
                to,
            });
        }
        debug!(
            iteration = self.iteration,
            member = self.member,
            attempt = self.attempt,
            from = %self.status,
            to = %to,
            reason = reason.unwrap_or(""),
            "Job transition"
        );
        self.transitions.push(JobTransition {
            from: self.status,
            to,
            attempt: self.attempt,
            at: Utc::now(),
            reason: reason.map(str::to_string),
        });
        if matches!(to, JobStatus::FailedRetryable | JobStatus::FailedExhausted) {
            if let Some(reason) = reason {
                self.last_error = Some(reason.to_string());
            }
        }
        self.status = to;
        Ok(())
    }

    /// Start the next attempt. Only valid while `Pending`.
    fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.remote_id = None;
    }
}

/// Terminal summary of one member job, persisted in the iteration report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberOutcome {
    pub member: u32,
    pub status: JobStatus,
    pub attempts: u32,
    /// The job was stopped by run cancellation rather than by failures.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteJobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<JobTransition>,
}

impl MemberOutcome {
    fn from_job(job: MemberJob, cancelled: bool) -> Self {
        Self {
            member: job.member,
            status: job.status,
            attempts: job.attempt,
            cancelled,
            remote_id: job.remote_id,
            last_error: job.last_error,
            transitions: job.transitions,
        }
    }

    /// Outcome for a lifecycle task that died without reporting.
    pub fn lost(member: u32, reason: impl Into<String>) -> Self {
        Self {
            member,
            status: JobStatus::FailedExhausted,
            attempts: 0,
            cancelled: false,
            remote_id: None,
            last_error: Some(reason.into()),
            transitions: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

enum AttemptResult {
    Succeeded,
    /// No remote job is left behind (never submitted, or already cancelled).
    Failed(String),
    /// The scheduler reported `id` as failed; it may still hold resources.
    JobFailed { id: RemoteJobId, reason: String },
    Cancelled,
}

/// Drives one member job to a terminal status against a backend.
#[derive(Clone)]
pub struct JobLifecycle {
    backend: Arc<dyn BackendClient>,
    policy: RetryPolicy,
    poll_permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl JobLifecycle {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        policy: RetryPolicy,
        poll_permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            policy,
            poll_permits,
            cancel,
        }
    }

    /// Run `job` until it succeeds, exhausts its retry budget, or the run is
    /// cancelled. Backend errors never escape; they consume attempts.
    pub async fn run(&self, mut job: MemberJob, command: &RenderedCommand) -> MemberOutcome {
        let max_attempts = self.policy.max_attempts();

        loop {
            if self.cancel.is_cancelled() {
                return self.give_up_cancelled(job);
            }

            job.begin_attempt();
            let result = self.run_attempt(&mut job, command).await;

            let reason = match result {
                AttemptResult::Succeeded => {
                    info!(
                        iteration = job.iteration,
                        member = job.member,
                        attempt = job.attempt,
                        "Member succeeded"
                    );
                    return MemberOutcome::from_job(job, false);
                }
                AttemptResult::Cancelled => return self.give_up_cancelled(job),
                AttemptResult::Failed(reason) => reason,
                AttemptResult::JobFailed { id, reason } => {
                    if job.attempt < max_attempts {
                        // Never resubmit while the previous job could still run.
                        self.cancel_remote(&id).await;
                    }
                    reason
                }
            };

            if job.attempt >= max_attempts {
                warn!(
                    iteration = job.iteration,
                    member = job.member,
                    attempts = job.attempt,
                    "Member exhausted retry budget: {}",
                    reason
                );
                self.transition(&mut job, JobStatus::FailedExhausted, &reason);
                return MemberOutcome::from_job(job, false);
            }

            self.transition(&mut job, JobStatus::FailedRetryable, &reason);
            let delay = self.policy.retry_delay_for(job.attempt);
            warn!(
                iteration = job.iteration,
                member = job.member,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                reason
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.give_up_cancelled(job),
                _ = tokio::time::sleep(delay) => {}
            }
            self.transition(&mut job, JobStatus::Pending, "retry");
        }
    }

    async fn run_attempt(&self, job: &mut MemberJob, command: &RenderedCommand) -> AttemptResult {
        // Submit runs to completion; an accepted job is cancelled by id.
        let submitted = self.bounded(self.backend.submit(job, command)).await;
        let id = match submitted {
            Ok(id) => id,
            Err(_) if self.cancel.is_cancelled() => return AttemptResult::Cancelled,
            Err(e) => return AttemptResult::Failed(format!("submit failed: {e}")),
        };
        job.remote_id = Some(id.clone());
        self.transition(job, JobStatus::Submitted, &format!("job {id}"));
        if self.cancel.is_cancelled() {
            self.cancel_remote(&id).await;
            return AttemptResult::Cancelled;
        }

        let interval = self.policy.effective_poll_interval();
        let mut consecutive_errors = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.cancel_remote(&id).await;
                    return AttemptResult::Cancelled;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let polled = {
                let _permit = self.poll_permits.acquire().await.ok();
                self.bounded(self.backend.poll(&id)).await
            };

            match polled {
                Ok(PollStatus::Running) => {
                    consecutive_errors = 0;
                    if job.status == JobStatus::Submitted {
                        self.transition(job, JobStatus::Running, "");
                    }
                }
                Ok(PollStatus::Succeeded) => {
                    self.transition(job, JobStatus::Succeeded, "");
                    return AttemptResult::Succeeded;
                }
                Ok(PollStatus::Failed { reason }) => {
                    return AttemptResult::JobFailed { id, reason }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        iteration = job.iteration,
                        member = job.member,
                        job_id = %id,
                        consecutive_errors,
                        "Poll error: {}",
                        e
                    );
                    if consecutive_errors >= self.policy.max_consecutive_poll_errors.max(1) {
                        self.cancel_remote(&id).await;
                        return AttemptResult::Failed(format!(
                            "lost contact with job {id} after {consecutive_errors} poll errors: {e}"
                        ));
                    }
                }
            }
        }
    }

    /// Bound a backend call by the policy's per-call timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        let limit = self.policy.poll_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    async fn cancel_remote(&self, id: &RemoteJobId) {
        if let Err(e) = self.bounded(self.backend.cancel(id)).await {
            warn!(job_id = %id, backend = self.backend.name(), "Cancel failed: {}", e);
        }
    }

    fn give_up_cancelled(&self, mut job: MemberJob) -> MemberOutcome {
        self.transition(&mut job, JobStatus::FailedExhausted, "cancelled");
        MemberOutcome::from_job(job, true)
    }

    fn transition(&self, job: &mut MemberJob, to: JobStatus, reason: &str) {
        let reason = (!reason.is_empty()).then_some(reason);
        if let Err(e) = job.advance(to, reason) {
            // Terminal statuses are never left; anything else is a bug in the loop above.
            warn!(iteration = job.iteration, member = job.member, "{}", e);
        }
    }
}
