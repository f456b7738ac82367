//! Project-level configuration from `llmctl.toml`.
//!
//! Layering follows file → environment → CLI: the file provides defaults,
//! and explicit CLI flags always win. Absent file means defaults.
//!
//! ```toml
//! [orchestrator]
//! workspaces_root = "workspaces"
//! max_dispatch_concurrency = 8
//!
//! [instructions]
//! role_id = "role-default"
//! role_body = "You are an autonomous workflow agent."
//! agent_id = "agent-default"
//! agent_body = "Execute the node request precisely."
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::instructions::InstructionSource;

/// Filename looked up in the working directory.
pub const CONFIG_FILENAME: &str = "llmctl.toml";

/// Parsed `llmctl.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub orchestrator: OrchestratorSection,
    pub instructions: InstructionsSection,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Root for per-run sandbox workspaces.
    pub workspaces_root: PathBuf,
    /// Global dispatch concurrency ceiling.
    pub max_dispatch_concurrency: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            workspaces_root: PathBuf::from("workspaces"),
            max_dispatch_concurrency: 16,
        }
    }
}

/// `[instructions]` section: the tenant-default role/agent pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionsSection {
    pub role_id: String,
    pub role_version: u32,
    pub role_body: String,
    pub agent_id: String,
    pub agent_version: u32,
    pub agent_body: String,
}

impl Default for InstructionsSection {
    fn default() -> Self {
        Self {
            role_id: "role-default".to_string(),
            role_version: 1,
            role_body: "You are an autonomous workflow agent.".to_string(),
            agent_id: "agent-default".to_string(),
            agent_version: 1,
            agent_body: "Execute the node request precisely and report structured output."
                .to_string(),
        }
    }
}

impl ProjectConfig {
    /// Load `llmctl.toml` from the given directory, or defaults when the
    /// file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILENAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// The instruction source this config describes.
    pub fn instruction_source(&self) -> InstructionSource {
        InstructionSource {
            role_id: self.instructions.role_id.clone(),
            role_version: self.instructions.role_version,
            role_body: self.instructions.role_body.clone(),
            agent_id: self.instructions.agent_id.clone(),
            agent_version: self.instructions.agent_version,
            agent_body: self.instructions.agent_body.clone(),
            priorities: Vec::new(),
            runtime_overrides: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.orchestrator.max_dispatch_concurrency, 16);
        assert_eq!(config.instructions.role_id, "role-default");
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"
[orchestrator]
max_dispatch_concurrency = 4

[instructions]
role_body = "Custom role."
"#,
        )
        .unwrap();

        let config = ProjectConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.orchestrator.max_dispatch_concurrency, 4);
        assert_eq!(
            config.orchestrator.workspaces_root,
            PathBuf::from("workspaces")
        );
        let source = config.instruction_source();
        assert_eq!(source.role_body, "Custom role.");
        assert_eq!(source.agent_id, "agent-default");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "not toml {{{{").unwrap();
        assert!(ProjectConfig::load_or_default(dir.path()).is_err());
    }
}
