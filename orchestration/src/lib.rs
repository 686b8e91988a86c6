//! Ensemble Calibration Orchestration Library
//!
//! Drives iterative ensemble optimization runs whose member evaluations are
//! external forward-model programs:
//! - Execution backends behind one submit/poll/cancel contract (local worker
//!   pool, Slurm, PBS)
//! - Per-member job lifecycle with retry budget and backoff
//! - Iteration barrier fanning out one lifecycle per ensemble member
//! - Iteration-indexed checkpoint layout for crash/preemption resume
//! - Calibration driver state machine gluing it all to an external optimizer
//!
//! # Iteration
//!
//! ```text
//! Driver ── IterationRunning(i) ──> Barrier ──> N × JobLifecycle ──> BackendClient
//!    │                                  │
//!    │<── BarrierReport ────────────────┘
//!    ├── read member outputs → EnsembleOutputMatrix (sentinel for exhausted members)
//!    ├── CheckpointStore::save_outputs(i)
//!    ├── IterationUpdating(i): Optimizer::update(state, matrix)
//!    └── CheckpointStore::save_state(i + 1) → IterationRunning(i + 1) | Terminated
//! ```
//!
//! The library never reads ambient process state; the `calibrate` binary is
//! the boundary that turns config files and environment into the explicit
//! types defined here.

#![allow(clippy::uninlined_format_args)]

pub mod backend;
pub mod barrier;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod ensemble;
pub mod error;
pub mod forward_model;
pub mod lifecycle;
pub mod optimizer;

// Re-export key backend types
pub use backend::{
    cluster::{ClusterBackend, ClusterConfig, SchedulerFlavor, SchedulerState},
    local::{LocalPoolBackend, LocalPoolConfig},
    resolve::{BackendResolver, BackendRule},
    Backend, BackendClient, BackendDescriptor, BackendSettings, PollStatus, RemoteJobId,
    RenderedCommand,
};

// Re-export lifecycle and barrier types
pub use barrier::{BarrierReport, IterationBarrier};
pub use lifecycle::{JobLifecycle, JobStatus, JobTransition, MemberJob, MemberOutcome};

// Re-export persistence and data types
pub use checkpoint::{Checkpoint, CheckpointStore, MemberParameters, RunCompletion};
pub use ensemble::{EnsembleOutputMatrix, JsonOutputReader, OutputReader, ParameterMatrix};
pub use optimizer::{Optimizer, OptimizerState, Prior, UpdateOutcome};

// Re-export config, driver, and error types
pub use config::{ExperimentConfig, FailurePolicy, RetryPolicy};
pub use driver::{CalibrationDriver, DriverState, DriverTransition, RunSummary};
pub use error::{
    BackendError, CheckpointError, OptimizerError, OrchestrationError, RunFailure,
};
pub use forward_model::{ForwardModelEnv, ModelCommand};
