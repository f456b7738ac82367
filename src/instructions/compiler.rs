//! Deterministic instruction package compiler.
//!
//! Identical inputs must produce byte-identical artifacts and an identical
//! package hash: text is normalized (UTF-8, LF, trimmed line ends, single
//! terminating newline), artifacts are emitted under stable headings, and
//! the manifest is hashed over canonical JSON (sorted keys, compact
//! separators - the serde_json defaults).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Directory under the workspace root holding the materialized package.
pub const INSTRUCTIONS_DIR: &str = ".instructions";

/// Payload size above which the compiler emits a warning (no truncation).
const OVERSIZE_WARNING_BYTES: usize = 256 * 1024;

/// Compilation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("Invalid {artifact} body: {message}")]
    InvalidBody {
        artifact: &'static str,
        message: String,
    },

    #[error("Failed to materialize package at {path}: {message}")]
    Materialize { path: PathBuf, message: String },
}

/// Run mode; autorun includes priorities, manual omits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Autorun,
    Manual,
}

impl RunMode {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autorun => "autorun",
            Self::Manual => "manual",
        }
    }
}

/// Provider identity attached to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Provider id, e.g. `claude`.
    pub id: String,
    /// Adapter family the provider belongs to.
    pub family: super::ProviderFamily,
}

/// One ordered priority entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    /// Priority id.
    pub id: String,
    /// Stored position; the compiler preserves this order.
    pub position: u32,
    /// Priority body.
    pub body: String,
}

/// Inputs to one compilation.
#[derive(Debug, Clone)]
pub struct InstructionSource {
    pub role_id: String,
    pub role_version: u32,
    pub role_body: String,
    pub agent_id: String,
    pub agent_version: u32,
    pub agent_body: String,
    /// Priorities in stored order.
    pub priorities: Vec<Priority>,
    /// Optional runtime overrides appended to the merged instructions.
    pub runtime_overrides: Option<String>,
}

/// Manifest entry for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// SHA-256 of the artifact bytes, hex.
    pub sha256: String,
    /// Artifact size in bytes.
    pub size: u64,
}

/// Package manifest; serialized field order is the canonical form.
///
/// `BTreeMap` keys and serde_json's default map ordering give sorted keys;
/// default serialization gives compact separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub artifacts: BTreeMap<String, ManifestEntry>,
    pub role_id: String,
    pub role_version: u32,
    pub agent_id: String,
    pub agent_version: u32,
    pub priority_ids: Vec<String>,
    pub run_mode: RunMode,
    pub provider_id: String,
}

/// A compiled, deterministic instruction package.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionPackage {
    /// Artifact name -> normalized content.
    pub artifacts: BTreeMap<String, String>,
    /// The manifest describing the artifacts.
    pub manifest: Manifest,
    /// SHA-256 of the canonicalized manifest JSON, hex.
    pub package_hash: String,
    /// Warnings (e.g. oversize payload); never fatal.
    pub warnings: Vec<String>,
}

impl InstructionPackage {
    /// The merged instruction text.
    pub fn instructions(&self) -> &str {
        self.artifacts
            .get("INSTRUCTIONS")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The compiler itself; stateless.
pub struct InstructionCompiler;

impl InstructionCompiler {
    /// Compile a package.
    ///
    /// Priorities are included in stored order for autorun runs and
    /// omitted entirely otherwise. Empty role or agent bodies are invalid.
    pub fn compile(
        source: &InstructionSource,
        run_mode: RunMode,
        provider: &ProviderDescriptor,
    ) -> Result<InstructionPackage, CompileError> {
        let role = normalize(&source.role_body);
        if role.trim().is_empty() {
            return Err(CompileError::InvalidBody {
                artifact: "role",
                message: "body is empty after normalization".to_string(),
            });
        }
        let agent = normalize(&source.agent_body);
        if agent.trim().is_empty() {
            return Err(CompileError::InvalidBody {
                artifact: "agent",
                message: "body is empty after normalization".to_string(),
            });
        }

        let mut artifacts = BTreeMap::new();
        artifacts.insert("ROLE".to_string(), role.clone());
        artifacts.insert("AGENT".to_string(), agent.clone());

        let priorities = match run_mode {
            RunMode::Autorun if !source.priorities.is_empty() => {
                let mut body = String::new();
                for priority in &source.priorities {
                    body.push_str(&format!("## Priority {}\n\n", priority.position));
                    body.push_str(normalize(&priority.body).trim_end());
                    body.push_str("\n\n");
                }
                let body = normalize(&body);
                artifacts.insert("PRIORITIES".to_string(), body.clone());
                Some(body)
            }
            _ => None,
        };

        let mut merged = String::new();
        merged.push_str("# Role\n\n");
        merged.push_str(role.trim_end());
        merged.push_str("\n\n---\n\n# Agent\n\n");
        merged.push_str(agent.trim_end());
        if let Some(priorities) = &priorities {
            merged.push_str("\n\n---\n\n# Priorities\n\n");
            merged.push_str(priorities.trim_end());
        }
        if let Some(overrides) = &source.runtime_overrides {
            let overrides = normalize(overrides);
            if !overrides.trim().is_empty() {
                merged.push_str("\n\n---\n\n# Runtime Overrides\n\n");
                merged.push_str(overrides.trim_end());
            }
        }
        let merged = normalize(&merged);
        artifacts.insert("INSTRUCTIONS".to_string(), merged);

        let mut warnings = Vec::new();
        let total_bytes: usize = artifacts.values().map(String::len).sum();
        if total_bytes > OVERSIZE_WARNING_BYTES {
            warnings.push(format!(
                "instruction payload is {total_bytes} bytes (over {OVERSIZE_WARNING_BYTES}); not truncated"
            ));
        }

        let manifest = Manifest {
            artifacts: artifacts
                .iter()
                .map(|(name, content)| {
                    (
                        name.clone(),
                        ManifestEntry {
                            sha256: sha256_hex(content.as_bytes()),
                            size: content.len() as u64,
                        },
                    )
                })
                .collect(),
            role_id: source.role_id.clone(),
            role_version: source.role_version,
            agent_id: source.agent_id.clone(),
            agent_version: source.agent_version,
            priority_ids: match run_mode {
                RunMode::Autorun => source.priorities.iter().map(|p| p.id.clone()).collect(),
                RunMode::Manual => Vec::new(),
            },
            run_mode,
            provider_id: provider.id.clone(),
        };

        let canonical = canonical_manifest_json(&manifest);
        let package_hash = sha256_hex(canonical.as_bytes());

        Ok(InstructionPackage {
            artifacts,
            manifest,
            package_hash,
            warnings,
        })
    }

    /// Write the package into `<workspace_root>/.instructions/`.
    ///
    /// Returns the paths written, manifest last.
    pub fn materialize(
        package: &InstructionPackage,
        workspace_root: &Path,
    ) -> Result<Vec<PathBuf>, CompileError> {
        let dir = workspace_root.join(INSTRUCTIONS_DIR);
        fs::create_dir_all(&dir).map_err(|e| CompileError::Materialize {
            path: dir.clone(),
            message: e.to_string(),
        })?;

        let mut written = Vec::new();
        for (name, content) in &package.artifacts {
            let path = dir.join(format!("{name}.md"));
            fs::write(&path, content).map_err(|e| CompileError::Materialize {
                path: path.clone(),
                message: e.to_string(),
            })?;
            written.push(path);
        }

        let manifest_path = dir.join("manifest.json");
        fs::write(&manifest_path, canonical_manifest_json(&package.manifest)).map_err(|e| {
            CompileError::Materialize {
                path: manifest_path.clone(),
                message: e.to_string(),
            }
        })?;
        written.push(manifest_path);
        Ok(written)
    }
}

/// Canonical manifest form: sorted keys, compact separators.
fn canonical_manifest_json(manifest: &Manifest) -> String {
    // serde_json's Value map is sorted; round-tripping through Value
    // canonicalizes struct field order too.
    let value = serde_json::to_value(manifest).unwrap_or_default();
    value.to_string()
}

/// Text normalization: LF newlines, trimmed trailing whitespace per line,
/// exactly one terminating newline.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.replace("\r\n", "\n").replace('\r', "\n").split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::ProviderFamily;

    fn provider() -> ProviderDescriptor {
        ProviderDescriptor {
            id: "claude".to_string(),
            family: ProviderFamily::Claude,
        }
    }

    fn source() -> InstructionSource {
        InstructionSource {
            role_id: "role-1".to_string(),
            role_version: 3,
            role_body: "You are a careful engineer.  \r\nKeep diffs small.\r\n".to_string(),
            agent_id: "agent-1".to_string(),
            agent_version: 7,
            agent_body: "Work the queue.".to_string(),
            priorities: vec![
                Priority {
                    id: "p-1".to_string(),
                    position: 1,
                    body: "Ship the migration".to_string(),
                },
                Priority {
                    id: "p-2".to_string(),
                    position: 2,
                    body: "Then clean up flags".to_string(),
                },
            ],
            runtime_overrides: None,
        }
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize("a  \r\nb\r"), "a\nb\n");
        assert_eq!(normalize("a\n\n\n"), "a\n");
        assert_eq!(normalize("a"), "a\n");
    }

    #[test]
    fn compile_is_deterministic() {
        let a = InstructionCompiler::compile(&source(), RunMode::Autorun, &provider()).unwrap();
        let b = InstructionCompiler::compile(&source(), RunMode::Autorun, &provider()).unwrap();
        assert_eq!(a.artifacts, b.artifacts);
        assert_eq!(a.package_hash, b.package_hash);
        assert_eq!(a.manifest, b.manifest);
    }

    #[test]
    fn autorun_includes_priorities_in_stored_order() {
        let pkg = InstructionCompiler::compile(&source(), RunMode::Autorun, &provider()).unwrap();
        let priorities = pkg.artifacts.get("PRIORITIES").unwrap();
        let first = priorities.find("Ship the migration").unwrap();
        let second = priorities.find("Then clean up flags").unwrap();
        assert!(first < second);
        assert_eq!(pkg.manifest.priority_ids, vec!["p-1", "p-2"]);
        assert!(pkg.instructions().contains("# Priorities"));
    }

    #[test]
    fn manual_omits_priorities() {
        let pkg = InstructionCompiler::compile(&source(), RunMode::Manual, &provider()).unwrap();
        assert!(!pkg.artifacts.contains_key("PRIORITIES"));
        assert!(pkg.manifest.priority_ids.is_empty());
        assert!(!pkg.instructions().contains("# Priorities"));
    }

    #[test]
    fn run_mode_changes_package_hash() {
        let autorun =
            InstructionCompiler::compile(&source(), RunMode::Autorun, &provider()).unwrap();
        let manual =
            InstructionCompiler::compile(&source(), RunMode::Manual, &provider()).unwrap();
        assert_ne!(autorun.package_hash, manual.package_hash);
    }

    #[test]
    fn empty_role_body_is_invalid() {
        let mut bad = source();
        bad.role_body = "   \n\n".to_string();
        let err =
            InstructionCompiler::compile(&bad, RunMode::Manual, &provider()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvalidBody { artifact: "role", .. }
        ));
    }

    #[test]
    fn oversize_payload_warns_without_truncation() {
        let mut big = source();
        big.agent_body = "x".repeat(OVERSIZE_WARNING_BYTES + 1);
        let pkg = InstructionCompiler::compile(&big, RunMode::Manual, &provider()).unwrap();
        assert_eq!(pkg.warnings.len(), 1);
        assert!(pkg.artifacts.get("AGENT").unwrap().len() > OVERSIZE_WARNING_BYTES);
    }

    #[test]
    fn materialize_writes_artifacts_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = InstructionCompiler::compile(&source(), RunMode::Autorun, &provider()).unwrap();
        let written = InstructionCompiler::materialize(&pkg, dir.path()).unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"ROLE.md".to_string()));
        assert!(names.contains(&"AGENT.md".to_string()));
        assert!(names.contains(&"INSTRUCTIONS.md".to_string()));
        assert!(names.contains(&"PRIORITIES.md".to_string()));
        assert!(names.contains(&"manifest.json".to_string()));

        let manifest_text =
            std::fs::read_to_string(dir.path().join(INSTRUCTIONS_DIR).join("manifest.json"))
                .unwrap();
        let manifest: Manifest = serde_json::from_str(&manifest_text).unwrap();
        assert_eq!(manifest, pkg.manifest);
        // Hashing the canonical manifest bytes reproduces the package hash.
        assert_eq!(sha256_hex(manifest_text.as_bytes()), pkg.package_hash);
    }

    #[test]
    fn runtime_overrides_appended() {
        let mut with_overrides = source();
        with_overrides.runtime_overrides = Some("Prefer streaming APIs.".to_string());
        let pkg =
            InstructionCompiler::compile(&with_overrides, RunMode::Manual, &provider()).unwrap();
        assert!(pkg.instructions().contains("# Runtime Overrides"));
        assert!(pkg.instructions().contains("Prefer streaming APIs."));
    }
}
