//! Forward-model command template and its process-boundary environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::RenderedCommand;
use crate::error::OrchestrationError;

pub const ENV_EXPERIMENT_DIR: &str = "CALIBRATE_EXPERIMENT_DIR";
pub const ENV_ITERATION: &str = "CALIBRATE_ITERATION";
pub const ENV_MEMBER: &str = "CALIBRATE_MEMBER";
pub const ENV_MODEL_INTERFACE: &str = "CALIBRATE_MODEL_INTERFACE";
pub const ENV_MEMBER_DIR: &str = "CALIBRATE_MEMBER_DIR";

/// The user-supplied forward-model program and its argument template.
///
/// `args` may contain `{iteration}`, `{member}`, `{member_dir}` and
/// `{experiment_dir}` placeholders. `interface` names the model-interface
/// program exported to the job when `program` is a wrapper; it defaults to
/// `program`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<PathBuf>,
}

impl ModelCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            interface: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn model_interface(&self) -> &Path {
        self.interface.as_deref().unwrap_or(&self.program)
    }

    /// Render the command for one member of one iteration.
    pub fn render(
        &self,
        experiment_dir: &Path,
        iteration: u32,
        member: u32,
        member_dir: &Path,
        log_path: &Path,
    ) -> RenderedCommand {
        let env = ForwardModelEnv {
            experiment_dir: experiment_dir.to_path_buf(),
            iteration,
            member,
            model_interface: self.model_interface().to_path_buf(),
            member_dir: member_dir.to_path_buf(),
        };

        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{iteration}", &iteration.to_string())
                    .replace("{member}", &member.to_string())
                    .replace("{member_dir}", &member_dir.to_string_lossy())
                    .replace("{experiment_dir}", &experiment_dir.to_string_lossy())
            })
            .collect();

        RenderedCommand {
            program: self.program.clone(),
            args,
            env: env.to_vars(),
            working_dir: member_dir.to_path_buf(),
            log_path: log_path.to_path_buf(),
        }
    }
}

/// Configuration every forward-model job receives through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardModelEnv {
    pub experiment_dir: PathBuf,
    pub iteration: u32,
    pub member: u32,
    pub model_interface: PathBuf,
    pub member_dir: PathBuf,
}

impl ForwardModelEnv {
    pub fn to_vars(&self) -> Vec<(String, String)> {
        vec![
            (
                ENV_EXPERIMENT_DIR.to_string(),
                self.experiment_dir.to_string_lossy().into_owned(),
            ),
            (ENV_ITERATION.to_string(), self.iteration.to_string()),
            (ENV_MEMBER.to_string(), self.member.to_string()),
            (
                ENV_MODEL_INTERFACE.to_string(),
                self.model_interface.to_string_lossy().into_owned(),
            ),
            (
                ENV_MEMBER_DIR.to_string(),
                self.member_dir.to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Rebuild from a variable lookup. Any missing or unparseable value is a
    /// configuration error; there are no silent defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OrchestrationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| OrchestrationError::Configuration(format!("{key} is not set")))
        };
        let index = |key: &str| -> Result<u32, OrchestrationError> {
            let raw = required(key)?;
            raw.trim().parse().map_err(|_| {
                OrchestrationError::Configuration(format!("{key}={raw} is not an index"))
            })
        };

        Ok(Self {
            experiment_dir: PathBuf::from(required(ENV_EXPERIMENT_DIR)?),
            iteration: index(ENV_ITERATION)?,
            member: index(ENV_MEMBER)?,
            model_interface: PathBuf::from(required(ENV_MODEL_INTERFACE)?),
            member_dir: PathBuf::from(required(ENV_MEMBER_DIR)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_render_substitutes_placeholders() {
        let cmd = ModelCommand::new("/opt/model/run.sh")
            .with_args(["--params", "{member_dir}/parameters.json", "--tag", "i{iteration}-m{member}"]);
        let rendered = cmd.render(
            Path::new("/runs/exp"),
            2,
            7,
            Path::new("/runs/exp/iteration_002/member_007"),
            Path::new("/runs/exp/iteration_002/member_007/model_log.txt"),
        );

        assert_eq!(
            rendered.args,
            vec![
                "--params",
                "/runs/exp/iteration_002/member_007/parameters.json",
                "--tag",
                "i2-m7"
            ]
        );
        assert_eq!(
            rendered.working_dir,
            PathBuf::from("/runs/exp/iteration_002/member_007")
        );
        let env: HashMap<_, _> = rendered.env.into_iter().collect();
        assert_eq!(env[ENV_ITERATION], "2");
        assert_eq!(env[ENV_MEMBER], "7");
        assert_eq!(env[ENV_MODEL_INTERFACE], "/opt/model/run.sh");
    }

    #[test]
    fn test_env_round_trip_through_lookup() {
        let env = ForwardModelEnv {
            experiment_dir: PathBuf::from("/runs/exp"),
            iteration: 0,
            member: 3,
            model_interface: PathBuf::from("/opt/model/run.sh"),
            member_dir: PathBuf::from("/runs/exp/iteration_000/member_003"),
        };
        let vars: HashMap<_, _> = env.to_vars().into_iter().collect();
        let back = ForwardModelEnv::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_missing_env_is_configuration_error() {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert(ENV_EXPERIMENT_DIR.into(), "/runs/exp".into());
        vars.insert(ENV_ITERATION.into(), "1".into());
        // member missing
        let err = ForwardModelEnv::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains(ENV_MEMBER));

        vars.insert(ENV_MEMBER.into(), "three".into());
        let err = ForwardModelEnv::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("not an index"));
    }
}
