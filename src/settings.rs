//! Layered configuration loaded from `levelup.yaml`.
//!
//! Every field has a sensible default so a bare repository works with no
//! config file at all. The state database path additionally honors the
//! `LEVELUP_DB_PATH` environment variable and a CLI flag, in that order of
//! increasing precedence handled by the caller.
//!
//! ```yaml
//! project:
//!   language: python
//!   test_command: pytest
//! pipeline:
//!   max_agent_retries: 2
//!   max_revision_cycles: 3
//!   create_git_branch: true
//! llm:
//!   model: claude-sonnet-4-5
//!   claude_executable: claude
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "levelup.yaml";
pub const DB_PATH_ENV: &str = "LEVELUP_DB_PATH";

/// Project-related configuration. Explicit values here override detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

/// Pipeline behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Retries per agent step before the run fails.
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,
    /// REVISE cycles allowed per checkpoint before the run fails.
    #[serde(default = "default_max_revision_cycles")]
    pub max_revision_cycles: u32,
    /// Security-driven coding rework cycles before the checkpoint takes over.
    #[serde(default = "default_max_rework_cycles")]
    pub max_rework_cycles: u32,
    #[serde(default = "default_true")]
    pub require_checkpoints: bool,
    #[serde(default = "default_true")]
    pub create_git_branch: bool,
    /// How often a headless run polls the store for a checkpoint decision.
    #[serde(default = "default_poll_interval_ms")]
    pub checkpoint_poll_interval_ms: u64,
}

fn default_max_agent_retries() -> u32 {
    2
}

fn default_max_revision_cycles() -> u32 {
    3
}

fn default_max_rework_cycles() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_agent_retries: default_max_agent_retries(),
            max_revision_cycles: default_max_revision_cycles(),
            max_rework_cycles: default_max_rework_cycles(),
            require_checkpoints: default_true(),
            create_git_branch: default_true(),
            checkpoint_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PipelineSettings {
    pub fn checkpoint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_poll_interval_ms)
    }
}

/// LLM backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_claude_executable")]
    pub claude_executable: String,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_claude_executable() -> String {
    "claude".to_string()
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            claude_executable: default_claude_executable(),
        }
    }
}

/// Shared-state configuration: database file and worktree root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub worktree_root: Option<PathBuf>,
}

/// Root settings tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub project: ProjectSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub state: StateSettings,
}

impl Settings {
    /// Load `levelup.yaml` from the project directory, falling back to
    /// defaults when the file is absent.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(settings)
    }

    /// Per-user state directory, `~/.levelup` by default.
    pub fn state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".levelup")
    }

    /// Resolve the state database path: CLI flag, then `LEVELUP_DB_PATH`,
    /// then `state.db_path` from the settings file, then the default under
    /// the per-user state directory.
    pub fn db_path(&self, flag: Option<&Path>) -> PathBuf {
        if let Some(p) = flag {
            return p.to_path_buf();
        }
        if let Some(p) = std::env::var_os(DB_PATH_ENV) {
            return PathBuf::from(p);
        }
        if let Some(p) = &self.state.db_path {
            return p.clone();
        }
        Self::state_dir().join("state.db")
    }

    /// Root directory for per-run worktree checkouts.
    pub fn worktree_root(&self) -> PathBuf {
        self.state
            .worktree_root
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("worktrees"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_no_settings_file() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.pipeline.max_agent_retries, 2);
        assert_eq!(settings.pipeline.max_revision_cycles, 3);
        assert_eq!(settings.pipeline.max_rework_cycles, 1);
        assert!(settings.pipeline.require_checkpoints);
        assert!(settings.pipeline.create_git_branch);
        assert_eq!(settings.llm.claude_executable, "claude");
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "pipeline:\n  max_revision_cycles: 5\n  create_git_branch: false\nproject:\n  language: rust\n",
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.pipeline.max_revision_cycles, 5);
        assert!(!settings.pipeline.create_git_branch);
        assert_eq!(settings.pipeline.max_agent_retries, 2);
        assert_eq!(settings.project.language.as_deref(), Some("rust"));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "pipeline: [not a map").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }

    #[test]
    fn db_path_precedence_flag_over_settings() {
        let settings = Settings {
            state: StateSettings {
                db_path: Some(PathBuf::from("/from/settings.db")),
                worktree_root: None,
            },
            ..Default::default()
        };
        assert_eq!(
            settings.db_path(Some(Path::new("/from/flag.db"))),
            PathBuf::from("/from/flag.db")
        );
        assert_eq!(settings.db_path(None), PathBuf::from("/from/settings.db"));
    }

    #[test]
    fn poll_interval_converts_to_duration() {
        let settings = Settings::default();
        assert_eq!(
            settings.pipeline.checkpoint_poll_interval(),
            Duration::from_millis(1000)
        );
    }
}
