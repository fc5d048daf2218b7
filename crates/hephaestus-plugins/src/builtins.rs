//! Built-in quality-gate plugins: thin wrappers over tool subprocesses.
//!
//! Each built-in wraps one tool invocation; an absent tool degrades to a
//! failed result rather than an error so the orchestrator reports it like any
//! other gate failure.

use crate::command::{CommandRunner, ExecutionError};
use async_trait::async_trait;
use hephaestus_core::{GateSpec, Plugin, PluginCategory, PluginMetadata, PluginResult};
use semver::Version;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// A plugin that runs one external command in the workspace.
pub struct CommandPlugin {
    metadata: PluginMetadata,
    program: String,
    args: Vec<String>,
}

impl CommandPlugin {
    pub fn new(metadata: PluginMetadata, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            metadata,
            program: program.into(),
            args,
        }
    }

    fn workspace_from(config: &Value) -> PathBuf {
        config
            .get("workspace")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn extra_args(config: &Value) -> Vec<String> {
        config
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn validate_config(&self, config: &Value) -> bool {
        if !config.is_object() {
            return false;
        }
        match config.get("args") {
            None => true,
            Some(Value::Array(items)) => items.iter().all(Value::is_string),
            Some(_) => false,
        }
    }

    async fn run(
        &self,
        config: &Value,
    ) -> Result<PluginResult, Box<dyn std::error::Error + Send + Sync>> {
        let workspace = Self::workspace_from(config);
        let mut args = self.args.clone();
        args.extend(Self::extra_args(config));

        let runner = CommandRunner::new().with_working_dir(&workspace);
        match runner.run(&self.program, &args).await {
            Ok(result) => {
                let message = if result.success {
                    format!("{} passed", self.metadata.name)
                } else {
                    format!(
                        "{} failed (exit {}): {}",
                        self.metadata.name,
                        result.exit_code,
                        result.summary_line()
                    )
                };
                Ok(PluginResult {
                    success: result.success,
                    message,
                    details: Some(json!({
                        "command": result.command,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                    })),
                    exit_code: result.exit_code,
                })
            }
            Err(ExecutionError::ToolMissing(tool)) => Ok(PluginResult::failed(
                format!("{tool} is not installed (ToolMissing)"),
                127,
            )),
            Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }
}

fn metadata(
    name: &str,
    description: &str,
    category: PluginCategory,
    order: i32,
) -> PluginMetadata {
    PluginMetadata {
        name: name.to_string(),
        version: Version::new(0, 1, 0),
        description: description.to_string(),
        author: "hephaestus".to_string(),
        category,
        requires: Vec::new(),
        order,
    }
}

pub fn ruff_check() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("ruff-check", "Ruff lint pass", PluginCategory::Linting, 10),
        "ruff",
        vec!["check".to_string(), ".".to_string()],
    ))
}

pub fn ruff_format() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("ruff-format", "Ruff formatter in check mode", PluginCategory::Formatting, 20),
        "ruff",
        vec!["format".to_string(), "--check".to_string(), ".".to_string()],
    ))
}

pub fn yamllint() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("yamllint", "YAML lint pass", PluginCategory::Linting, 25),
        "yamllint",
        vec![".".to_string()],
    ))
}

pub fn mypy() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("mypy", "Static type check", PluginCategory::TypeChecking, 30),
        "mypy",
        vec![".".to_string()],
    ))
}

pub fn pytest() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("pytest", "Test suite", PluginCategory::Testing, 40),
        "pytest",
        Vec::new(),
    ))
}

pub fn pip_audit() -> Arc<dyn Plugin> {
    Arc::new(CommandPlugin::new(
        metadata("pip-audit", "Dependency vulnerability audit", PluginCategory::Security, 50),
        "pip-audit",
        Vec::new(),
    ))
}

/// The registry's built-in set, in pipeline order.
pub fn builtin_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![ruff_check(), ruff_format(), mypy(), pytest(), pip_audit()]
}

/// The legacy fixed sequence used when plugins are not enabled:
/// ruff-check, ruff-format, yamllint, mypy, pytest, pip-audit. The
/// orchestrator drops the formatting gate itself when `--no-format` is set.
pub fn legacy_gates() -> Vec<GateSpec> {
    vec![
        GateSpec::new(ruff_check()),
        GateSpec::new(ruff_format()),
        GateSpec::new(yamllint()),
        GateSpec::new(mypy()),
        GateSpec::new(pytest()),
        GateSpec::new(pip_audit()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hephaestus_core::execute_plugin;

    #[test]
    fn builtin_orders_follow_the_pipeline() {
        let orders: Vec<(String, i32)> = builtin_plugins()
            .iter()
            .map(|p| (p.metadata().name.clone(), p.metadata().order))
            .collect();
        assert_eq!(
            orders,
            vec![
                ("ruff-check".to_string(), 10),
                ("ruff-format".to_string(), 20),
                ("mypy".to_string(), 30),
                ("pytest".to_string(), 40),
                ("pip-audit".to_string(), 50),
            ]
        );
    }

    #[test]
    fn config_validation_rejects_non_string_args() {
        let plugin = ruff_check();
        assert!(plugin.validate_config(&json!({})));
        assert!(plugin.validate_config(&json!({"args": ["--fix"]})));
        assert!(!plugin.validate_config(&json!({"args": [1, 2]})));
        assert!(!plugin.validate_config(&json!("not-an-object")));
    }

    #[tokio::test]
    async fn missing_tool_degrades_to_failed_result() {
        let plugin = CommandPlugin::new(
            metadata("ghost", "never installed", PluginCategory::Custom, 99),
            "definitely-not-a-real-tool-xyz",
            Vec::new(),
        );
        let result = execute_plugin(&plugin, &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 127);
        assert!(result.message.contains("ToolMissing"));
    }

    #[tokio::test]
    async fn command_plugin_reports_tool_failure() {
        let plugin = CommandPlugin::new(
            metadata("false-gate", "always fails", PluginCategory::Custom, 1),
            "sh",
            vec!["-c".to_string(), "echo broken; exit 2".to_string()],
        );
        let result = execute_plugin(&plugin, &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert!(result.message.contains("broken"));
    }
}
