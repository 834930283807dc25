use std::path::PathBuf;
use std::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::graph::{Language, ModelSpec};

/// Overrides the interpreter used for `python` models.
pub const PYTHON_ENV: &str = "MODELWIRE_PYTHON";
/// Overrides the interpreter used for `r` models.
pub const RSCRIPT_ENV: &str = "MODELWIRE_RSCRIPT";

const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_RSCRIPT: &str = "Rscript";
const SHELL: &str = "sh";

/// How a model process is started.
///
/// Compiled languages share the `Executable` variant: the graph points at a
/// prebuilt binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    Executable {
        language: Language,
        program: PathBuf,
        args: Vec<String>,
    },
    Python { script: PathBuf, args: Vec<String> },
    R { script: PathBuf, args: Vec<String> },
    /// A script file, or `-c <commands>` as the arguments.
    Shell { args: Vec<String> },
}

impl LaunchSpec {
    pub fn from_model(model: &ModelSpec) -> Result<Self> {
        let Some((first, rest)) = model.args.split_first() else {
            return Err(OrchestratorError::Configuration(format!(
                "model '{}' ({}) needs at least one argument naming what to run",
                model.name, model.language
            )));
        };
        let rest = rest.to_vec();

        Ok(match model.language {
            Language::Executable | Language::C | Language::Cpp | Language::Fortran => {
                LaunchSpec::Executable {
                    language: model.language,
                    program: PathBuf::from(first),
                    args: rest,
                }
            }
            Language::Python => LaunchSpec::Python {
                script: PathBuf::from(first),
                args: rest,
            },
            Language::R => LaunchSpec::R {
                script: PathBuf::from(first),
                args: rest,
            },
            Language::Shell => LaunchSpec::Shell {
                args: model.args.clone(),
            },
        })
    }

    pub fn language(&self) -> Language {
        match self {
            LaunchSpec::Executable { language, .. } => *language,
            LaunchSpec::Python { .. } => Language::Python,
            LaunchSpec::R { .. } => Language::R,
            LaunchSpec::Shell { .. } => Language::Shell,
        }
    }

    /// Process command without environment, directory or stdio applied.
    pub fn command(&self) -> Command {
        match self {
            LaunchSpec::Executable { program, args, .. } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            LaunchSpec::Python { script, args } => {
                let mut command = Command::new(interpreter(PYTHON_ENV, DEFAULT_PYTHON));
                command.arg(script).args(args);
                command
            }
            LaunchSpec::R { script, args } => {
                let mut command = Command::new(interpreter(RSCRIPT_ENV, DEFAULT_RSCRIPT));
                command.arg(script).args(args);
                command
            }
            LaunchSpec::Shell { args } => {
                let mut command = Command::new(SHELL);
                command.args(args);
                command
            }
        }
    }
}

fn interpreter(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
