//! Subprocess execution for quality-gate tools.
//!
//! Spawned tools inherit a scrubbed environment: any variable whose name
//! looks credential-bearing is stripped before exec.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The tool binary is not on PATH.
    #[error("tool not found: {0}")]
    ToolMissing(String),

    #[error("failed to run {program}: {message}")]
    Io { program: String, message: String },
}

/// Captured outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandResult {
    /// First non-empty output line, for gate summaries.
    pub fn summary_line(&self) -> String {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_string()
    }
}

/// Environment variable name fragments that must never reach a subprocess.
const SCRUBBED_ENV_FRAGMENTS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "API_KEY", "CREDENTIAL"];

/// Runs tools with captured output and a scrubbed environment.
pub struct CommandRunner {
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self { working_dir: None }
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandResult, ExecutionError> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, _) in std::env::vars() {
            let upper = key.to_ascii_uppercase();
            if SCRUBBED_ENV_FRAGMENTS
                .iter()
                .any(|fragment| upper.contains(fragment))
            {
                command.env_remove(&key);
            }
        }

        let rendered = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        tracing::debug!(target: "hephaestus::plugins", command = %rendered, "running gate tool");

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::ToolMissing(program.to_string())
            } else {
                ExecutionError::Io {
                    program: program.to_string(),
                    message: e.to_string(),
                }
            }
        })?;
        Ok(CommandResult {
            command: rendered,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}
