//! Local worker pool backend.
//!
//! Each submitted attempt becomes a tokio task that waits for a worker
//! permit, then runs the forward model as a child process with stdout and
//! stderr appended to the member's run log. Semaphore-guarded so at most
//! `max_workers` forward models execute at once.
//!
//! Cancellation is cooperative: `cancel` trips the task's token, which kills
//! the child if it is running or drops the task if it is still queued. A job
//! that outlives `job_timeout` is killed and reported as failed.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{prepare_log, BackendClient, PollStatus, RemoteJobId, RenderedCommand};
use crate::error::BackendError;
use crate::lifecycle::MemberJob;

/// Local pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPoolConfig {
    /// Maximum concurrently executing forward models.
    pub max_workers: usize,
    /// Wall-clock limit per forward-model run; `None` waits forever.
    pub job_timeout: Option<Duration>,
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_workers,
            job_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Queued,
    Running,
    Exited(Option<i32>),
    Errored(String),
    TimedOut(Duration),
    Cancelled,
}

struct TaskEntry {
    state: TaskState,
    cancel: CancellationToken,
}

type TaskTable = Arc<Mutex<HashMap<RemoteJobId, TaskEntry>>>;

/// Runs forward models as local child processes.
pub struct LocalPoolBackend {
    config: LocalPoolConfig,
    workers: Arc<Semaphore>,
    tasks: TaskTable,
}

impl LocalPoolBackend {
    pub fn new(config: LocalPoolConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            workers,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers.max(1)
    }

    /// Jobs still held in the task table.
    pub fn tracked_jobs(&self) -> usize {
        self.tasks.lock().map(|table| table.len()).unwrap_or(0)
    }

    fn set_state(tasks: &TaskTable, id: &RemoteJobId, state: TaskState) {
        if let Ok(mut table) = tasks.lock() {
            if let Some(entry) = table.get_mut(id) {
                // A cancelled task stays cancelled even if the child reaped late.
                if entry.state != TaskState::Cancelled {
                    entry.state = state;
                }
            }
        }
    }
}

async fn wait_bounded(
    child: &mut Child,
    limit: Option<Duration>,
) -> Option<std::io::Result<ExitStatus>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    }
}

async fn run_process(
    command: &RenderedCommand,
    cancel: &CancellationToken,
    job_timeout: Option<Duration>,
) -> Result<TaskState, BackendError> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&command.log_path)?;
    let log_err = log.try_clone()?;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&command.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()?;

    let stopped = tokio::select! {
        status = wait_bounded(&mut child, job_timeout) => match (status, job_timeout) {
            (Some(status), _) => return Ok(TaskState::Exited(status?.code())),
            (None, limit) => TaskState::TimedOut(limit.unwrap_or_default()),
        },
        _ = cancel.cancelled() => TaskState::Cancelled,
    };
    if let Err(e) = child.kill().await {
        warn!("Failed to kill forward model ({:?}): {}", stopped, e);
    }
    Ok(stopped)
}

#[async_trait]
impl BackendClient for LocalPoolBackend {
    fn name(&self) -> &'static str {
        "local_pool"
    }

    async fn submit(
        &self,
        job: &MemberJob,
        command: &RenderedCommand,
    ) -> Result<RemoteJobId, BackendError> {
        prepare_log(&command.log_path, job.attempt())?;

        let id = RemoteJobId(format!("local-{}", Uuid::new_v4()));
        let cancel = CancellationToken::new();
        {
            let mut table = self
                .tasks
                .lock()
                .map_err(|_| BackendError::Submit("local task table poisoned".into()))?;
            table.insert(
                id.clone(),
                TaskEntry {
                    state: TaskState::Queued,
                    cancel: cancel.clone(),
                },
            );
        }

        let tasks = self.tasks.clone();
        let workers = self.workers.clone();
        let command = command.clone();
        let task_id = id.clone();
        let job_timeout = self.config.job_timeout;
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    Self::set_state(&tasks, &task_id, TaskState::Cancelled);
                    return;
                }
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        Self::set_state(&tasks, &task_id, TaskState::Errored("worker pool closed".into()));
                        return;
                    }
                },
            };

            Self::set_state(&tasks, &task_id, TaskState::Running);
            debug!(job_id = %task_id, program = %command.program.display(), "Local forward model started");
            let state = match run_process(&command, &cancel, job_timeout).await {
                Ok(state) => state,
                Err(e) => TaskState::Errored(e.to_string()),
            };
            drop(permit);
            debug!(job_id = %task_id, ?state, "Local forward model finished");
            Self::set_state(&tasks, &task_id, state);
        });

        info!(
            iteration = job.iteration(),
            member = job.member(),
            attempt = job.attempt(),
            job_id = %id,
            "Queued local job"
        );
        Ok(id)
    }

    async fn poll(&self, id: &RemoteJobId) -> Result<PollStatus, BackendError> {
        let mut table = self
            .tasks
            .lock()
            .map_err(|_| BackendError::CommandFailed("local task table poisoned".into()))?;
        let entry = table
            .get(id)
            .ok_or_else(|| BackendError::UnknownJob(id.to_string()))?;

        let status = match &entry.state {
            TaskState::Queued | TaskState::Running => PollStatus::Running,
            TaskState::Exited(Some(0)) => PollStatus::Succeeded,
            TaskState::Exited(Some(code)) => PollStatus::Failed {
                reason: format!("forward model exited with status {code}"),
            },
            TaskState::Exited(None) => PollStatus::Failed {
                reason: "forward model terminated by signal".into(),
            },
            TaskState::Errored(msg) => PollStatus::Failed {
                reason: msg.clone(),
            },
            TaskState::TimedOut(limit) => PollStatus::Failed {
                reason: format!("timed out after {}s", limit.as_secs_f64()),
            },
            TaskState::Cancelled => PollStatus::Failed {
                reason: "cancelled".into(),
            },
        };
        if status.is_terminal() {
            table.remove(id);
        }
        Ok(status)
    }

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), BackendError> {
        let mut table = self
            .tasks
            .lock()
            .map_err(|_| BackendError::CommandFailed("local task table poisoned".into()))?;
        match table.remove(id) {
            Some(entry) if matches!(entry.state, TaskState::Queued | TaskState::Running) => {
                entry.cancel.cancel();
                info!(job_id = %id, "Cancelled local job");
            }
            Some(_) => debug!(job_id = %id, "Cancel ignored: job already terminal"),
            None => debug!(job_id = %id, "Cancel ignored: unknown job"),
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn shell(dir: &Path, script: &str) -> RenderedCommand {
        RenderedCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![("CALIBRATE_MEMBER".into(), "1".into())],
            working_dir: dir.to_path_buf(),
            log_path: dir.join("model_log.txt"),
        }
    }

    fn pool(max_workers: usize) -> LocalPoolConfig {
        LocalPoolConfig {
            max_workers,
            job_timeout: None,
        }
    }

    async fn wait_terminal(backend: &LocalPoolBackend, id: &RemoteJobId) -> PollStatus {
        for _ in 0..500 {
            let status = backend.poll(id).await.unwrap();
            if status != PollStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("local job {id} never finished");
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_poll_status() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalPoolBackend::new(pool(2));
        let job = MemberJob::new(0, 1);

        let ok = backend
            .submit(&job, &shell(dir.path(), "echo member=$CALIBRATE_MEMBER"))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&backend, &ok).await, PollStatus::Succeeded);
        let log = std::fs::read_to_string(dir.path().join("model_log.txt")).unwrap();
        assert!(log.contains("member=1"));

        let bad = backend
            .submit(&job, &shell(dir.path(), "exit 3"))
            .await
            .unwrap();
        match wait_terminal(&backend, &bad).await {
            PollStatus::Failed { reason } => assert!(reason.contains('3')),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalPoolBackend::new(pool(1));
        let job = MemberJob::new(0, 1);

        let id = backend
            .submit(&job, &shell(dir.path(), "sleep 30"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.cancel(&id).await.unwrap();
        assert_eq!(backend.tracked_jobs(), 0);
        assert!(matches!(
            backend.poll(&id).await,
            Err(BackendError::UnknownJob(_))
        ));

        // The killed job gave its worker back.
        let next = backend
            .submit(&job, &shell(dir.path(), "exit 0"))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&backend, &next).await, PollStatus::Succeeded);

        // Cancelling a forgotten or unknown job is not an error.
        backend.cancel(&id).await.unwrap();
        backend
            .cancel(&RemoteJobId("local-missing".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_limit_queues_excess_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalPoolBackend::new(pool(1));
        let job = MemberJob::new(0, 1);

        let first = backend
            .submit(&job, &shell(dir.path(), "sleep 30"))
            .await
            .unwrap();
        let second = backend
            .submit(&job, &shell(dir.path(), "exit 0"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The second job cannot start while the only worker is busy.
        assert_eq!(backend.poll(&second).await.unwrap(), PollStatus::Running);

        backend.cancel(&first).await.unwrap();
        assert_eq!(wait_terminal(&backend, &second).await, PollStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_job_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalPoolBackend::new(LocalPoolConfig {
            max_workers: 1,
            job_timeout: Some(Duration::from_millis(100)),
        });
        let job = MemberJob::new(0, 1);

        let started = std::time::Instant::now();
        let id = backend
            .submit(&job, &shell(dir.path(), "sleep 10"))
            .await
            .unwrap();
        match wait_terminal(&backend, &id).await {
            PollStatus::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminal_poll_forgets_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalPoolBackend::new(pool(2));
        let job = MemberJob::new(0, 1);

        let id = backend
            .submit(&job, &shell(dir.path(), "exit 0"))
            .await
            .unwrap();
        assert_eq!(backend.tracked_jobs(), 1);
        assert_eq!(wait_terminal(&backend, &id).await, PollStatus::Succeeded);
        assert_eq!(backend.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_poll_unknown_job_errors() {
        let backend = LocalPoolBackend::new(LocalPoolConfig::default());
        assert!(matches!(
            backend.poll(&RemoteJobId("nope".into())).await,
            Err(BackendError::UnknownJob(_))
        ));
    }
}
