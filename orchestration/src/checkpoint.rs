//! Iteration-indexed checkpoint layout.
//!
//! ```text
//! output_dir/
//!   iteration_NNN/
//!     state.json        optimizer state (commit marker, written last)
//!     outputs.json      ensemble output matrix (null = sentinel)
//!     report.json       per-member barrier report
//!     failure.json      only after a fatal update failure
//!     member_MMM/
//!       parameters.json
//!       model_log.txt
//!       output.json
//!   run_complete.json
//! ```
//!
//! Indices are zero-padded to width 3. Every file is written to a temporary
//! sibling and renamed into place, so readers see old or new content, never
//! a torn write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::barrier::BarrierReport;
use crate::ensemble::EnsembleOutputMatrix;
use crate::error::{CheckpointError, CheckpointResult};
use crate::optimizer::{OptimizerState, Prior};

pub const STATE_FILE: &str = "state.json";
pub const OUTPUTS_FILE: &str = "outputs.json";
pub const REPORT_FILE: &str = "report.json";
pub const FAILURE_FILE: &str = "failure.json";
pub const PARAMETERS_FILE: &str = "parameters.json";
pub const LOG_FILE: &str = "model_log.txt";
pub const COMPLETE_FILE: &str = "run_complete.json";

/// Highest committed iteration found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub iteration: u32,
    /// `outputs.json` is present: the barrier finished, the update did not.
    pub has_outputs: bool,
}

/// Marker written once a run terminates normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub final_iteration: u32,
    pub terminated_early: bool,
    pub completed_at: DateTime<Utc>,
    pub final_state: OptimizerState,
}

/// Parameter file handed to one member's forward model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberParameters {
    pub iteration: u32,
    pub member: u32,
    /// Parameter name → value.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// The same values in ensemble column order.
    pub values: Vec<f64>,
}

/// Diagnostics persisted when the optimizer update fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureRecord {
    iteration: u32,
    error: String,
    at: DateTime<Utc>,
}

/// Reads and writes the checkpoint layout under one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.root.join(format!("iteration_{:03}", iteration))
    }

    pub fn member_dir(&self, iteration: u32, member: u32) -> PathBuf {
        self.iteration_dir(iteration)
            .join(format!("member_{:03}", member))
    }

    pub fn log_path(&self, iteration: u32, member: u32) -> PathBuf {
        self.member_dir(iteration, member).join(LOG_FILE)
    }

    /// Render per-member parameter files, then commit the state blob.
    pub fn save_state(
        &self,
        iteration: u32,
        state: &OptimizerState,
        prior: &Prior,
    ) -> CheckpointResult<()> {
        for (idx, row) in state.ensemble.rows().iter().enumerate() {
            let member = idx as u32 + 1;
            let dir = self.member_dir(iteration, member);
            create_dir(&dir)?;

            let parameters = row
                .iter()
                .enumerate()
                .map(|(col, v)| (prior.parameter_name(col), serde_json::json!(v)))
                .collect();
            let file = MemberParameters {
                iteration,
                member,
                parameters,
                values: row.clone(),
            };
            write_json(&dir.join(PARAMETERS_FILE), &file)?;
        }

        let path = self.iteration_dir(iteration).join(STATE_FILE);
        write_json(&path, state)?;
        info!(
            iteration,
            members = state.ensemble.len(),
            path = %path.display(),
            "Checkpoint committed"
        );
        Ok(())
    }

    pub fn load_state(&self, iteration: u32) -> CheckpointResult<OptimizerState> {
        read_json(&self.iteration_dir(iteration).join(STATE_FILE))
    }

    pub fn load_parameters(
        &self,
        iteration: u32,
        member: u32,
    ) -> CheckpointResult<MemberParameters> {
        read_json(&self.member_dir(iteration, member).join(PARAMETERS_FILE))
    }

    pub fn save_outputs(
        &self,
        iteration: u32,
        outputs: &EnsembleOutputMatrix,
    ) -> CheckpointResult<()> {
        write_json(&self.iteration_dir(iteration).join(OUTPUTS_FILE), outputs)
    }

    /// Load an outputs matrix, checking it has one entry per member.
    pub fn load_outputs(
        &self,
        iteration: u32,
        ensemble_size: u32,
    ) -> CheckpointResult<EnsembleOutputMatrix> {
        let outputs: EnsembleOutputMatrix =
            read_json(&self.iteration_dir(iteration).join(OUTPUTS_FILE))?;
        if outputs.len() != ensemble_size as usize {
            return Err(CheckpointError::Malformed(format!(
                "iteration_{:03}/{} has {} entries, expected {}",
                iteration,
                OUTPUTS_FILE,
                outputs.len(),
                ensemble_size
            )));
        }
        Ok(outputs)
    }

    pub fn save_report(&self, iteration: u32, report: &BarrierReport) -> CheckpointResult<()> {
        write_json(&self.iteration_dir(iteration).join(REPORT_FILE), report)
    }

    pub fn load_report(&self, iteration: u32) -> CheckpointResult<Option<BarrierReport>> {
        let path = self.iteration_dir(iteration).join(REPORT_FILE);
        match read_json(&path) {
            Ok(report) => Ok(Some(report)),
            Err(CheckpointError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save_failure(&self, iteration: u32, error: &str) -> CheckpointResult<()> {
        let record = FailureRecord {
            iteration,
            error: error.to_string(),
            at: Utc::now(),
        };
        write_json(&self.iteration_dir(iteration).join(FAILURE_FILE), &record)
    }

    pub fn mark_complete(&self, completion: &RunCompletion) -> CheckpointResult<()> {
        write_json(&self.root.join(COMPLETE_FILE), completion)
    }

    pub fn completion(&self) -> CheckpointResult<Option<RunCompletion>> {
        match read_json(&self.root.join(COMPLETE_FILE)) {
            Ok(c) => Ok(Some(c)),
            Err(CheckpointError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Highest iteration directory holding a parseable state blob.
    ///
    /// Directories without a state blob are skipped; a state blob that
    /// cannot be read or parsed is an error.
    pub fn latest_checkpoint(&self) -> CheckpointResult<Option<Checkpoint>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(&self.root, e)),
        };

        let mut iterations: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| parse_iteration_dir(&entry.file_name().to_string_lossy()))
            .collect();
        iterations.sort_unstable_by(|a, b| b.cmp(a));

        for iteration in iterations {
            match self.load_state(iteration) {
                Ok(_) => {
                    let has_outputs = self.iteration_dir(iteration).join(OUTPUTS_FILE).is_file();
                    debug!(iteration, has_outputs, "Found latest checkpoint");
                    return Ok(Some(Checkpoint {
                        iteration,
                        has_outputs,
                    }));
                }
                Err(CheckpointError::Missing(_)) => {
                    debug!(iteration, "Skipping uncommitted iteration directory");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn parse_iteration_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("iteration_")?;
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn create_dir(dir: &Path) -> CheckpointResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| CheckpointError::io(dir, e))
}

/// Serialize to a temporary sibling, then rename over `path`.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> CheckpointResult<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let json = serde_json::to_vec_pretty(value).map_err(|e| CheckpointError::json(path, e))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    std::fs::write(&tmp, json).map_err(|e| CheckpointError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CheckpointError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CheckpointResult<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CheckpointError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    serde_json::from_str(&raw).map_err(|e| CheckpointError::json(path, e))
}
