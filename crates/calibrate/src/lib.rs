//! Command-line boundary for calibration runs.
//!
//! Turns `calibrate.toml`, `CALIBRATE_*` environment variables and the host
//! identity into the explicit types the `orchestration` crate expects, and
//! supplies the external-process optimizer.

pub mod commands;
pub mod external_optimizer;
pub mod run_member;
pub mod settings;

pub use commands::{build_driver, status, RunStatus};
pub use external_optimizer::CommandOptimizer;
pub use settings::CalibrateSettings;
