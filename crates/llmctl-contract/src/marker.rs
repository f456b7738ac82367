//! Dispatch startup marker negotiation.
//!
//! The executor's first stdout or stderr line must announce that the
//! process actually started. Two forms are accepted: the bare literal, or a
//! JSON event carrying the contract version. Anything else - including
//! valid JSON with the wrong version - is ignored, and the dispatcher keeps
//! scanning until its marker timeout elapses.

use serde::Deserialize;

use crate::EXECUTION_CONTRACT_VERSION;

/// Literal form of the startup marker.
pub const STARTUP_MARKER_LITERAL: &str = "LLMCTL_EXECUTOR_STARTED";

/// Event name used by the JSON form of the startup marker.
pub const STARTUP_MARKER_EVENT: &str = "executor_started";

/// A recognized startup marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupMarker {
    /// The bare `LLMCTL_EXECUTOR_STARTED` line.
    Literal,
    /// The JSON event form, with its timestamp preserved.
    Event { ts: String },
}

/// Wire shape of the JSON marker event.
#[derive(Debug, Deserialize)]
struct MarkerEvent {
    event: String,
    contract_version: String,
    #[serde(default)]
    ts: String,
}

/// Parse one log line as a startup marker.
///
/// Returns `None` for anything that is not a valid marker: free-form log
/// output, malformed JSON, a different event, or a marker announcing a
/// contract version the orchestrator does not speak. First valid marker
/// wins; the caller keeps scanning on `None`.
pub fn parse_startup_marker(line: &str) -> Option<StartupMarker> {
    let line = line.trim();
    if line == STARTUP_MARKER_LITERAL {
        return Some(StartupMarker::Literal);
    }
    if !line.starts_with('{') {
        return None;
    }
    let event: MarkerEvent = serde_json::from_str(line).ok()?;
    if event.event != STARTUP_MARKER_EVENT {
        return None;
    }
    if event.contract_version != EXECUTION_CONTRACT_VERSION {
        return None;
    }
    Some(StartupMarker::Event { ts: event.ts })
}
