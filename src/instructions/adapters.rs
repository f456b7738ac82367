//! Provider adapters.
//!
//! A native adapter writes the provider's well-known instruction file at
//! the sandbox root; the fallback adapter writes nothing and instead
//! returns a structured prompt envelope for providers without an on-disk
//! convention. The capability set is fixed: materialize, fallback_payload,
//! describe.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::compiler::{CompileError, InstructionPackage};
use crate::run::state::AdapterMode;

/// Provider families with a known on-disk instruction convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Anthropic-style agents; `CLAUDE.md` at the sandbox root.
    Claude,
    /// OpenAI-style agents; `AGENTS.md` at the sandbox root.
    Codex,
    /// Google-style agents; `GEMINI.md` at the sandbox root.
    Gemini,
    /// No native convention; prompt envelope only.
    Generic,
}

impl ProviderFamily {
    /// The native instruction filename, when the family has one.
    pub fn native_filename(&self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("CLAUDE.md"),
            Self::Codex => Some("AGENTS.md"),
            Self::Gemini => Some("GEMINI.md"),
            Self::Generic => None,
        }
    }
}

/// Outcome of adapter materialization.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    /// Native or fallback.
    pub mode: AdapterMode,
    /// Adapter name for the node record.
    pub adapter: String,
    /// Files written at the sandbox root.
    pub materialized_paths: Vec<PathBuf>,
    /// Non-fatal notes.
    pub warnings: Vec<String>,
}

/// Structured prompt envelope returned by the fallback path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEnvelope {
    /// Role text as the system prompt.
    pub system: String,
    /// Merged instruction body.
    pub instructions: String,
    /// Priorities body, when the package carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<String>,
    /// Manifest package hash for provenance.
    pub package_hash: String,
}

/// Adapter capability set.
pub trait ProviderAdapter: Send + Sync {
    /// Stable adapter name.
    fn describe(&self) -> &'static str;

    /// Write the provider-native instruction file(s) at the sandbox root.
    fn materialize(
        &self,
        package: &InstructionPackage,
        sandbox_root: &Path,
    ) -> Result<AdapterResult, CompileError>;

    /// Structured prompt form of the package; never touches disk.
    fn fallback_payload(&self, package: &InstructionPackage) -> PromptEnvelope {
        PromptEnvelope {
            system: package
                .artifacts
                .get("ROLE")
                .cloned()
                .unwrap_or_default(),
            instructions: package.instructions().to_string(),
            priorities: package.artifacts.get("PRIORITIES").cloned(),
            package_hash: package.package_hash.clone(),
        }
    }
}

/// Native adapter writing one well-known filename.
struct NativeFileAdapter {
    name: &'static str,
    filename: &'static str,
}

impl ProviderAdapter for NativeFileAdapter {
    fn describe(&self) -> &'static str {
        self.name
    }

    fn materialize(
        &self,
        package: &InstructionPackage,
        sandbox_root: &Path,
    ) -> Result<AdapterResult, CompileError> {
        let path = sandbox_root.join(self.filename);
        fs::write(&path, package.instructions()).map_err(|e| CompileError::Materialize {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(AdapterResult {
            mode: AdapterMode::Native,
            adapter: self.name.to_string(),
            materialized_paths: vec![path],
            warnings: package.warnings.clone(),
        })
    }
}

/// Fallback adapter: envelope only, no files.
struct FallbackAdapter;

impl ProviderAdapter for FallbackAdapter {
    fn describe(&self) -> &'static str {
        "fallback"
    }

    fn materialize(
        &self,
        package: &InstructionPackage,
        _sandbox_root: &Path,
    ) -> Result<AdapterResult, CompileError> {
        Ok(AdapterResult {
            mode: AdapterMode::Fallback,
            adapter: "fallback".to_string(),
            materialized_paths: Vec::new(),
            warnings: package.warnings.clone(),
        })
    }
}

/// Resolves the adapter for a provider family.
pub struct AdapterRegistry;

impl AdapterRegistry {
    /// The adapter for a family; generic families get the fallback.
    pub fn for_family(family: ProviderFamily) -> Box<dyn ProviderAdapter> {
        match family {
            ProviderFamily::Claude => Box::new(NativeFileAdapter {
                name: "claude-native",
                filename: "CLAUDE.md",
            }),
            ProviderFamily::Codex => Box::new(NativeFileAdapter {
                name: "codex-native",
                filename: "AGENTS.md",
            }),
            ProviderFamily::Gemini => Box::new(NativeFileAdapter {
                name: "gemini-native",
                filename: "GEMINI.md",
            }),
            ProviderFamily::Generic => Box::new(FallbackAdapter),
        }
    }
}
