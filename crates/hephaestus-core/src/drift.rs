//! Tool-version drift detection: declared versions vs what is installed.
//!
//! Declared floors come from the workspace `pyproject.toml`
//! (`[tool.hephaestus.tools]`, a map of tool name to version floor). Each tool
//! is probed with `tool --version`; major.minor must match the declaration,
//! patch differences are tolerated. Remediation prefers one lockfile sync
//! command when a lockfile is present.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("failed to read project manifest {path}: {source}")]
    ManifestRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse project manifest: {0}")]
    ManifestParse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftStatus {
    Ok,
    Drift,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEntry {
    pub tool: String,
    pub expected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub status: DriftStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
    pub remediation: Vec<String>,
}

impl DriftReport {
    /// Any entry with status `Drift` or `Missing` constitutes drift.
    pub fn has_drift(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.status != DriftStatus::Ok)
    }

    pub fn drifted_tools(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.status != DriftStatus::Ok)
            .map(|entry| entry.tool.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectManifest {
    #[serde(default)]
    tool: ToolSection,
}

#[derive(Debug, Default, Deserialize)]
struct ToolSection {
    #[serde(default)]
    hephaestus: HephaestusSection,
}

#[derive(Debug, Default, Deserialize)]
struct HephaestusSection {
    #[serde(default)]
    tools: std::collections::BTreeMap<String, String>,
}

/// Declared tool floors parsed from the workspace manifest.
pub fn declared_tools(workspace: &Path) -> Result<Vec<(String, String)>, DriftError> {
    let manifest_path = workspace.join("pyproject.toml");
    if !manifest_path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&manifest_path).map_err(|source| DriftError::ManifestRead {
        path: manifest_path,
        source,
    })?;
    let manifest: ProjectManifest = toml::from_str(&raw)?;
    Ok(manifest.tool.hephaestus.tools.into_iter().collect())
}

/// Pull the first `X.Y` or `X.Y.Z` token out of a `--version` banner.
fn parse_version_banner(banner: &str) -> Option<Version> {
    for token in banner.split_whitespace() {
        let token = token.trim_start_matches('v').trim_end_matches(',');
        let mut parts = token.split('.');
        let major = parts.next()?.parse::<u64>().ok();
        if let Some(major) = major {
            let minor = parts.next().and_then(|p| p.parse::<u64>().ok()).unwrap_or(0);
            let patch = parts
                .next()
                .and_then(|p| p.split(|c: char| !c.is_ascii_digit()).next())
                .and_then(|p| p.parse::<u64>().ok())
                .unwrap_or(0);
            return Some(Version::new(major, minor, patch));
        }
    }
    None
}

fn major_minor_matches(expected: &Version, actual: &Version) -> bool {
    expected.major == actual.major && expected.minor == actual.minor
}

async fn probe_tool(tool: &str) -> Option<Version> {
    let output = Command::new(tool).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let banner = String::from_utf8_lossy(&output.stdout);
    parse_version_banner(&banner).or_else(|| {
        // Some tools print their banner to stderr.
        parse_version_banner(&String::from_utf8_lossy(&output.stderr))
    })
}

/// Compare declared floors against installed tools and generate remediation.
pub async fn detect_drift(workspace: &Path) -> Result<DriftReport, DriftError> {
    let declared = declared_tools(workspace)?;
    let mut report = DriftReport::default();

    for (tool, expected_raw) in declared {
        let expected = match Version::parse(expected_raw.trim_start_matches(['>', '=', '~', '^'])) {
            Ok(version) => version,
            Err(_) => {
                tracing::warn!(target: "hephaestus::drift", tool = %tool, declared = %expected_raw, "unparseable declared version");
                continue;
            }
        };
        let entry = match probe_tool(&tool).await {
            Some(actual) if major_minor_matches(&expected, &actual) => DriftEntry {
                tool,
                expected: expected.to_string(),
                actual: Some(actual.to_string()),
                status: DriftStatus::Ok,
            },
            Some(actual) => DriftEntry {
                tool,
                expected: expected.to_string(),
                actual: Some(actual.to_string()),
                status: DriftStatus::Drift,
            },
            None => DriftEntry {
                tool,
                expected: expected.to_string(),
                actual: None,
                status: DriftStatus::Missing,
            },
        };
        report.entries.push(entry);
    }

    report.remediation = remediation_commands(workspace, &report);
    Ok(report)
}

/// Prefer one lockfile sync; fall back to per-tool installs at the declared
/// floors.
fn remediation_commands(workspace: &Path, report: &DriftReport) -> Vec<String> {
    if !report.has_drift() {
        return Vec::new();
    }
    if workspace.join("uv.lock").exists() {
        return vec!["uv sync --locked".to_string()];
    }
    if workspace.join("poetry.lock").exists() {
        return vec!["poetry install --sync".to_string()];
    }
    report
        .entries
        .iter()
        .filter(|entry| entry.status != DriftStatus::Ok)
        .map(|entry| format!("pip install '{}>={}'", entry.tool, entry.expected))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_version_banners() {
        assert_eq!(
            parse_version_banner("ruff 0.6.4"),
            Some(Version::new(0, 6, 4))
        );
        assert_eq!(
            parse_version_banner("mypy 1.11.2 (compiled: yes)"),
            Some(Version::new(1, 11, 2))
        );
        assert_eq!(
            parse_version_banner("pytest 8.3"),
            Some(Version::new(8, 3, 0))
        );
        assert_eq!(parse_version_banner("no digits here"), None);
    }

    #[test]
    fn patch_differences_are_tolerated() {
        assert!(major_minor_matches(
            &Version::new(1, 11, 0),
            &Version::new(1, 11, 9)
        ));
        assert!(!major_minor_matches(
            &Version::new(1, 11, 0),
            &Version::new(1, 12, 0)
        ));
    }

    #[test]
    fn declared_tools_reads_hephaestus_table() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            r#"
[tool.hephaestus.tools]
ruff = "0.6.0"
mypy = "1.11.0"
"#,
        )
        .unwrap();
        let declared = declared_tools(dir.path()).unwrap();
        assert_eq!(
            declared,
            vec![
                ("mypy".to_string(), "1.11.0".to_string()),
                ("ruff".to_string(), "0.6.0".to_string()),
            ]
        );
    }

    #[test]
    fn missing_manifest_means_nothing_declared() {
        let dir = tempfile::tempdir().unwrap();
        assert!(declared_tools(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn remediation_prefers_lockfile_sync() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uv.lock"), "").unwrap();
        let report = DriftReport {
            entries: vec![DriftEntry {
                tool: "ruff".to_string(),
                expected: "0.6.0".to_string(),
                actual: None,
                status: DriftStatus::Missing,
            }],
            remediation: Vec::new(),
        };
        assert_eq!(
            remediation_commands(dir.path(), &report),
            vec!["uv sync --locked".to_string()]
        );
    }

    #[test]
    fn remediation_falls_back_to_per_tool_installs() {
        let dir = tempfile::tempdir().unwrap();
        let report = DriftReport {
            entries: vec![DriftEntry {
                tool: "mypy".to_string(),
                expected: "1.11.0".to_string(),
                actual: Some("1.10.0".to_string()),
                status: DriftStatus::Drift,
            }],
            remediation: Vec::new(),
        };
        assert_eq!(
            remediation_commands(dir.path(), &report),
            vec!["pip install 'mypy>=1.11.0'".to_string()]
        );
    }
}
