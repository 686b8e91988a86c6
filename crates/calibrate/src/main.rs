use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use calibrate::settings::{host_identity, CalibrateSettings};
use calibrate::{build_driver, run_member, status};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code after an operator interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;
const EXIT_CONFIGURATION: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ensemble calibration runs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the experiment, resuming from the latest checkpoint
    Run {
        #[arg(long, default_value = "calibrate.toml")]
        config: PathBuf,

        /// Host identity for backend resolution (overrides CALIBRATE_HOST)
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the latest checkpoint and completion state
    Status {
        #[arg(long, default_value = "calibrate.toml")]
        config: PathBuf,
    },
    /// Run the model interface for one member (executed inside a job)
    RunMember {
        /// Extra arguments passed to the model interface
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn load_settings(config: &std::path::Path) -> Result<CalibrateSettings> {
    let mut settings = CalibrateSettings::load(config)?;
    settings.apply_overrides(env_lookup);
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Cmd::Run { config, host } => run(config, host).await,
        Cmd::Status { config } => match load_settings(&config).and_then(|s| status(&s)) {
            Ok(report) => {
                println!("{report}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
        Cmd::RunMember { args } => {
            match tokio::task::spawn_blocking(move || run_member::run_member(env_lookup, &args))
                .await
            {
                Ok(Ok(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                Ok(Err(e)) => {
                    error!("{e:#}");
                    ExitCode::from(EXIT_CONFIGURATION)
                }
                Err(e) => {
                    error!("run-member task failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run(config: PathBuf, host: Option<String>) -> ExitCode {
    let settings = match load_settings(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };
    let host = host_identity(host.as_deref(), env_lookup);

    let cancel = CancellationToken::new();
    let mut driver = match build_driver(&settings, &host, cancel.clone()) {
        Ok(d) => d,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received; cancelling outstanding jobs");
                signal_token.cancel();
            }
            Err(e) => warn!("Cannot listen for interrupts: {e}"),
        }
    });

    match driver.run().await {
        Ok(summary) => {
            info!(
                final_iteration = summary.final_iteration,
                iterations_run = summary.iterations_run,
                terminated_early = summary.terminated_early,
                "Calibration finished"
            );
            println!(
                "Calibration finished at iteration {:03} ({} iterations run this session)",
                summary.final_iteration, summary.iterations_run
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{failure}");
            eprintln!("calibrate: {failure}");
            if failure.error.is_interruption() {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if failure.error.is_configuration() {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
