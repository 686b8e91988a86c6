//! `calibrate run-member`: the wrapper a backend executes for each job.
//!
//! Reads the forward-model environment, then runs the model interface
//! program inside the member directory with inherited stdio so its output
//! lands in the run log the backend already redirected.

use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use orchestration::ForwardModelEnv;
use tracing::info;

/// Run the model interface for the member described by `lookup`.
///
/// Returns the program's exit code. An incomplete environment is a
/// configuration error and nothing is executed.
pub fn run_member<F>(lookup: F, extra_args: &[String]) -> Result<i32>
where
    F: Fn(&str) -> Option<String>,
{
    let env = ForwardModelEnv::from_lookup(lookup)?;
    info!(
        iteration = env.iteration,
        member = env.member,
        interface = %env.model_interface.display(),
        "Running forward model"
    );

    let status = Command::new(&env.model_interface)
        .args(extra_args)
        .current_dir(&env.member_dir)
        .envs(env.to_vars())
        .status()
        .with_context(|| {
            format!(
                "Failed to start model interface {}",
                env.model_interface.display()
            )
        })?;

    Ok(exit_code(status))
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
