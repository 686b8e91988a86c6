//! Iteration barrier: JoinSet fan-out of one lifecycle per member, fan-in
//! once every member is terminal.
//!
//! Poll calls across all members share a semaphore so a large ensemble does
//! not flood the scheduler. Execution concurrency is the backend's concern
//! (worker pool size, scheduler queue).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendClient, RenderedCommand};
use crate::config::RetryPolicy;
use crate::lifecycle::{JobLifecycle, JobStatus, JobTransition, MemberJob, MemberOutcome};

/// Per-member outcomes of one iteration, ordered by member index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierReport {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<MemberOutcome>,
}

impl BarrierReport {
    /// Members that did not succeed.
    pub fn failed_members(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.member)
            .collect()
    }

    pub fn succeeded(&self, member: u32) -> bool {
        self.outcome(member).is_some_and(MemberOutcome::succeeded)
    }

    pub fn outcome(&self, member: u32) -> Option<&MemberOutcome> {
        self.outcomes.iter().find(|o| o.member == member)
    }

    pub fn all_terminal(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_terminal())
    }

    /// Some member was stopped by cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.outcomes.iter().any(|o| o.cancelled)
    }

    /// Downgrade a succeeded member whose output turned out to be unusable.
    pub fn mark_exhausted(&mut self, member: u32, reason: &str) {
        if let Some(outcome) = self.outcomes.iter_mut().find(|o| o.member == member) {
            if outcome.status == JobStatus::FailedExhausted {
                return;
            }
            outcome.transitions.push(JobTransition {
                from: outcome.status,
                to: JobStatus::FailedExhausted,
                attempt: outcome.attempts,
                at: Utc::now(),
                reason: Some(reason.to_string()),
            });
            outcome.status = JobStatus::FailedExhausted;
            outcome.last_error = Some(reason.to_string());
        }
    }
}

/// Runs every member of an iteration to a terminal status.
pub struct IterationBarrier {
    backend: Arc<dyn BackendClient>,
    policy: RetryPolicy,
    poll_permits: Arc<Semaphore>,
}

impl IterationBarrier {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        policy: RetryPolicy,
        max_concurrent_polls: usize,
    ) -> Self {
        Self {
            backend,
            policy,
            poll_permits: Arc::new(Semaphore::new(max_concurrent_polls.max(1))),
        }
    }

    /// Block until every member in `commands` is `Succeeded` or
    /// `FailedExhausted`. Never returns early on member failure.
    pub async fn run(
        &self,
        iteration: u32,
        commands: Vec<(u32, RenderedCommand)>,
        cancel: CancellationToken,
    ) -> BarrierReport {
        let started_at = Utc::now();
        let mut pending: BTreeSet<u32> = commands.iter().map(|(m, _)| *m).collect();
        info!(
            iteration,
            members = pending.len(),
            backend = self.backend.name(),
            "Iteration barrier started"
        );

        let mut join_set: JoinSet<MemberOutcome> = JoinSet::new();
        for (member, command) in commands {
            let lifecycle = JobLifecycle::new(
                self.backend.clone(),
                self.policy.clone(),
                self.poll_permits.clone(),
                cancel.clone(),
            );
            join_set.spawn(async move {
                lifecycle
                    .run(MemberJob::new(iteration, member), &command)
                    .await
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(outcome) => {
                    pending.remove(&outcome.member);
                    outcomes.push(outcome);
                }
                Err(e) => warn!(iteration, error = %e, "Member lifecycle task panicked"),
            }
        }
        // Tasks that died without reporting.
        for member in pending {
            outcomes.push(MemberOutcome::lost(member, "lifecycle task aborted"));
        }
        outcomes.sort_by_key(|o| o.member);

        let report = BarrierReport {
            iteration,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            iteration,
            succeeded = report.outcomes.len() - report.failed_members().len(),
            failed = report.failed_members().len(),
            "Iteration barrier released"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PollStatus, RemoteJobId};
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Members listed in `failing` fail every attempt; the rest succeed on
    /// the second poll.
    struct FixtureBackend {
        failing: Vec<u32>,
        polls: Mutex<HashMap<RemoteJobId, (u32, u32)>>,
        submits: Mutex<Vec<(u32, u32)>>,
        cancels: Mutex<Vec<RemoteJobId>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        hang: bool,
    }

    impl FixtureBackend {
        fn new(failing: Vec<u32>) -> Self {
            Self {
                failing,
                polls: Mutex::new(HashMap::new()),
                submits: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl BackendClient for FixtureBackend {
        fn name(&self) -> &'static str {
            "fixture"
        }

        async fn submit(
            &self,
            job: &MemberJob,
            _command: &RenderedCommand,
        ) -> Result<RemoteJobId, BackendError> {
            let mut submits = self.submits.lock().unwrap();
            submits.push((job.member(), job.attempt()));
            let id = RemoteJobId(format!("{}-{}", job.member(), job.attempt()));
            self.polls
                .lock()
                .unwrap()
                .insert(id.clone(), (job.member(), 0));
            Ok(id)
        }

        async fn poll(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (member, polls) = {
                let mut table = self.polls.lock().unwrap();
                let entry = table.get_mut(id).unwrap();
                entry.1 += 1;
                *entry
            };
            if self.hang || polls < 2 {
                Ok(PollStatus::Running)
            } else if self.failing.contains(&member) {
                Ok(PollStatus::Failed {
                    reason: "exit 1".into(),
                })
            } else {
                Ok(PollStatus::Succeeded)
            }
        }

        async fn cancel(&self, id: &RemoteJobId) -> Result<(), BackendError> {
            self.cancels.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn commands(n: u32) -> Vec<(u32, RenderedCommand)> {
        (1..=n)
            .map(|m| {
                (
                    m,
                    RenderedCommand {
                        program: PathBuf::from("model"),
                        args: vec![],
                        env: vec![],
                        working_dir: PathBuf::from("/tmp"),
                        log_path: PathBuf::from("/tmp/model_log.txt"),
                    },
                )
            })
            .collect()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_members_exhaust_and_others_succeed() {
        let backend = Arc::new(FixtureBackend::new(vec![2, 4]));
        let barrier = IterationBarrier::new(backend.clone(), policy(1), 8);

        let report = barrier.run(0, commands(5), CancellationToken::new()).await;

        assert!(report.all_terminal());
        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.failed_members(), vec![2, 4]);
        for member in [1, 3, 5] {
            assert!(report.succeeded(member));
            assert_eq!(report.outcome(member).unwrap().attempts, 1);
        }
        for member in [2, 4] {
            let outcome = report.outcome(member).unwrap();
            assert_eq!(outcome.status, JobStatus::FailedExhausted);
            assert_eq!(outcome.attempts, 2);
        }
        let members: Vec<u32> = report.outcomes.iter().map(|o| o.member).collect();
        assert_eq!(members, vec![1, 2, 3, 4, 5]);
        assert_eq!(backend.submits.lock().unwrap().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_concurrency_is_bounded() {
        let backend = Arc::new(FixtureBackend::new(vec![]));
        let barrier = IterationBarrier::new(backend.clone(), policy(0), 2);

        let report = barrier.run(3, commands(6), CancellationToken::new()).await;
        assert!(report.failed_members().is_empty());
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reaches_every_member() {
        let mut fixture = FixtureBackend::new(vec![]);
        fixture.hang = true;
        let backend = Arc::new(fixture);
        let barrier = IterationBarrier::new(backend.clone(), policy(2), 8);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let report = barrier.run(1, commands(4), cancel).await;

        assert!(report.was_cancelled());
        assert_eq!(report.failed_members(), vec![1, 2, 3, 4]);
        assert_eq!(backend.cancels.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_mark_exhausted_downgrades_success() {
        let mut report = BarrierReport {
            iteration: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: vec![MemberOutcome {
                member: 1,
                status: JobStatus::Succeeded,
                attempts: 1,
                cancelled: false,
                remote_id: None,
                last_error: None,
                transitions: vec![],
            }],
        };
        report.mark_exhausted(1, "output unreadable");
        assert_eq!(report.failed_members(), vec![1]);
        assert_eq!(
            report.outcome(1).unwrap().last_error.as_deref(),
            Some("output unreadable")
        );
    }
}
