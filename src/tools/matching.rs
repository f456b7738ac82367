//! Shared target matching and state-document IO for the memory, plan, and
//! milestone domains.
//!
//! Matching rules: an explicit id wins; otherwise the normalized key is
//! compared. Exactly one hit mutates, zero hits is the caller's
//! warning-and-skip case, and more than one hit must fail the whole
//! operation.

use std::fs;
use std::path::Path;

use serde_json::Value;

use super::workspace::resolve_confined;

/// Normalize a match key: lowercase, trimmed, inner whitespace collapsed.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Result of matching a patch target against a set of entries.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Exactly one entry matched.
    One(usize),
    /// No entry matched.
    Missing,
    /// More than one entry matched; the operation must fail.
    Ambiguous(usize),
}

/// Match a `(id, key)` target against entries described by `(id, key)`
/// pairs. Id match takes precedence; key matching uses [`normalize_key`].
pub fn match_target(
    entries: &[(Option<String>, Option<String>)],
    target_id: Option<&str>,
    target_key: Option<&str>,
) -> MatchOutcome {
    if let Some(target_id) = target_id {
        let hits: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, (id, _))| id.as_deref() == Some(target_id))
            .map(|(i, _)| i)
            .collect();
        match hits.len() {
            1 => return MatchOutcome::One(hits[0]),
            n if n > 1 => return MatchOutcome::Ambiguous(n),
            _ => {}
        }
        // Fall through to key matching only when no id matched.
    }

    let Some(target_key) = target_key else {
        return MatchOutcome::Missing;
    };
    let wanted = normalize_key(target_key);
    let hits: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, (_, key))| key.as_deref().map(normalize_key) == Some(wanted.clone()))
        .map(|(i, _)| i)
        .collect();
    match hits.len() {
        0 => MatchOutcome::Missing,
        1 => MatchOutcome::One(hits[0]),
        n => MatchOutcome::Ambiguous(n),
    }
}

/// Directory under the workspace root holding domain state documents.
pub const STATE_DIR: &str = ".state";

/// Read a domain's state document, defaulting to the given empty shape.
pub(crate) fn read_state_doc(
    workspace_root: &Path,
    domain: &str,
    empty: Value,
) -> Result<Value, String> {
    let path = resolve_confined(workspace_root, &format!("{STATE_DIR}/{domain}.json"))?;
    if !path.exists() {
        return Ok(empty);
    }
    let text = fs::read_to_string(&path).map_err(|e| format!("cannot read {domain} state: {e}"))?;
    serde_json::from_str(&text).map_err(|e| format!("corrupt {domain} state document: {e}"))
}

/// Write a domain's state document.
pub(crate) fn write_state_doc(
    workspace_root: &Path,
    domain: &str,
    doc: &Value,
) -> Result<(), String> {
    let path = resolve_confined(workspace_root, &format!("{STATE_DIR}/{domain}.json"))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {e}"))?;
    }
    let text = serde_json::to_string_pretty(doc)
        .map_err(|e| format!("cannot serialize {domain} state: {e}"))?;
    fs::write(&path, text).map_err(|e| format!("cannot write {domain} state: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(Option<String>, Option<String>)> {
        vec![
            (Some("m-1".to_string()), Some("Deploy Notes".to_string())),
            (Some("m-2".to_string()), Some("retro actions".to_string())),
            (None, Some("deploy   notes".to_string())),
        ]
    }

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_key("  Deploy   Notes "), "deploy notes");
        assert_eq!(normalize_key("a\tb"), "a b");
    }

    #[test]
    fn id_match_takes_precedence() {
        assert_eq!(
            match_target(&entries(), Some("m-2"), Some("Deploy Notes")),
            MatchOutcome::One(1)
        );
    }

    #[test]
    fn key_fallback_when_id_misses() {
        // Unknown id falls back to the key, which is ambiguous here.
        assert_eq!(
            match_target(&entries(), Some("ghost"), Some("deploy notes")),
            MatchOutcome::Ambiguous(2)
        );
    }

    #[test]
    fn key_match_single_hit() {
        assert_eq!(
            match_target(&entries(), None, Some("RETRO ACTIONS")),
            MatchOutcome::One(1)
        );
    }

    #[test]
    fn no_target_is_missing() {
        assert_eq!(match_target(&entries(), None, None), MatchOutcome::Missing);
        assert_eq!(
            match_target(&entries(), None, Some("nothing here")),
            MatchOutcome::Missing
        );
    }

    #[test]
    fn state_doc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let empty = serde_json::json!({"entries": []});
        let loaded = read_state_doc(dir.path(), "memory", empty.clone()).unwrap();
        assert_eq!(loaded, empty);

        let doc = serde_json::json!({"entries": [{"id": "e1"}]});
        write_state_doc(dir.path(), "memory", &doc).unwrap();
        let loaded = read_state_doc(dir.path(), "memory", empty).unwrap();
        assert_eq!(loaded, doc);
    }
}
