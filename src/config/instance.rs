//! Per-instance configuration loaded from `config.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RelayError, Result};

pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub agent: AgentSection,
    pub model: String,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub sub_claude_instances: BTreeMap<String, String>,
    #[serde(default)]
    pub session_recording: RecordingConfig,
    #[serde(default)]
    pub advanced: AdvancedSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// Glob patterns over tool names. Empty means everything is allowed.
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub max_total_size_mb: u64,
    pub auto_cleanup: bool,
    /// Message types surfaced by default on the read path. `None` means all;
    /// recording itself always keeps every type.
    pub message_types: Option<Vec<String>>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            max_total_size_mb: 1000,
            auto_cleanup: true,
            message_types: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSection {
    pub permission_mode: PermissionMode,
    pub max_turns: Option<u32>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Ask,
    Auto,
    BypassPermissions,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Auto => write!(f, "auto"),
            Self::BypassPermissions => write!(f, "bypassPermissions"),
        }
    }
}

impl InstanceConfig {
    pub fn load(instance_path: &Path) -> Result<Self> {
        let config_file = instance_path.join(CONFIG_FILE);
        if !config_file.exists() {
            return Err(RelayError::Config(format!(
                "Missing config file: {}",
                config_file.display()
            )));
        }

        let content = std::fs::read_to_string(&config_file)?;
        let config: Self = serde_yaml_bw::from_str(&content)?;
        config.validate()?;

        debug!(path = %config_file.display(), agent = %config.agent.name, "Loaded instance config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.agent.name.trim().is_empty() {
            errors.push("agent.name must not be empty");
        }
        if self.model.trim().is_empty() {
            errors.push("model must not be empty");
        }
        if self.session_recording.retention_days == 0 {
            errors.push("session_recording.retention_days must be greater than 0");
        }
        if let Some(max_turns) = self.advanced.max_turns {
            if max_turns == 0 {
                errors.push("advanced.max_turns must be greater than 0");
            }
        }
        for (name, path) in &self.sub_claude_instances {
            if name.trim().is_empty() || path.trim().is_empty() {
                errors.push("sub_claude_instances entries must map a name to a directory");
                break;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Config(errors.join("; ")))
        }
    }

    /// Read the system prompt file, resolved relative to the instance
    /// directory when the configured path is not absolute.
    pub fn system_prompt(&self, instance_path: &Path) -> Result<Option<String>> {
        let Some(ref file) = self.system_prompt_file else {
            return Ok(None);
        };
        let path = if file.is_absolute() {
            file.clone()
        } else {
            instance_path.join(file)
        };
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RelayError::Config(format!("Cannot read system prompt {}: {}", path.display(), e))
        })?;
        Ok(Some(content))
    }

    /// Whether a tool name passes the allow/deny glob patterns. Deny wins;
    /// an empty allow list admits everything.
    pub fn tool_permitted(&self, tool_name: &str) -> bool {
        let matches = |patterns: &[String]| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|pattern| pattern.matches(tool_name))
                    .unwrap_or(false)
            })
        };

        if matches(&self.tools.disallowed) {
            return false;
        }
        self.tools.allowed.is_empty() || matches(&self.tools.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, content: &str) {
        std::fs::write(dir.join(CONFIG_FILE), content).unwrap();
    }

    #[test]
    fn test_load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "agent:\n  name: demo\nmodel: claude-sonnet-4-5\n",
        );

        let config = InstanceConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent.name, "demo");
        assert!(config.session_recording.enabled);
        assert_eq!(config.advanced.permission_mode, PermissionMode::Ask);
        assert!(config.sub_claude_instances.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            concat!(
                "agent:\n  name: parent\n  description: Parent agent\n",
                "model: claude-sonnet-4-5\n",
                "tools:\n  disallowed: [\"sub_claude_*\"]\n",
                "sub_claude_instances:\n  code_reviewer: code_reviewer_agent\n",
                "session_recording:\n  retention_days: 7\n",
                "advanced:\n  permission_mode: bypassPermissions\n  max_turns: 5\n",
            ),
        );

        let config = InstanceConfig::load(dir.path()).unwrap();
        assert_eq!(config.session_recording.retention_days, 7);
        assert_eq!(
            config.advanced.permission_mode,
            PermissionMode::BypassPermissions
        );
        assert_eq!(
            config.sub_claude_instances.get("code_reviewer").unwrap(),
            "code_reviewer_agent"
        );
    }

    #[test]
    fn test_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "agent:\n  name: \"\"\nmodel: m\n");

        assert!(InstanceConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_tool_permissions() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            concat!(
                "agent:\n  name: demo\nmodel: m\n",
                "tools:\n  allowed: [\"calculator__*\", \"sub_claude_reviewer\"]\n",
                "  disallowed: [\"calculator__dangerous\"]\n",
            ),
        );

        let config = InstanceConfig::load(dir.path()).unwrap();
        assert!(config.tool_permitted("calculator__add"));
        assert!(config.tool_permitted("sub_claude_reviewer"));
        assert!(!config.tool_permitted("calculator__dangerous"));
        assert!(!config.tool_permitted("unlisted"));
    }
}
