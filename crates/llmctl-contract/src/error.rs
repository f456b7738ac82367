//! Shared error taxonomy carried across the dispatch boundary.
//!
//! These are taxonomic codes, not language types: the executor classifies
//! its failure into one of the codes below and the orchestrator persists
//! the envelope verbatim without re-interpretation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compact failure classification shared by executor and orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request shape invalid, path traversal, unknown enum, malformed image reference.
    ValidationError,
    /// Job submission API failure before the start marker.
    DispatchError,
    /// No terminal state within the execution timeout.
    Timeout,
    /// Force or graceful cancellation observed.
    Cancelled,
    /// Node execution itself failed (provider/tool errors bubbled up).
    ExecutionError,
    /// Integration or provider unreachable, or rejected credentials.
    ProviderError,
    /// Contract version mismatch, kubeconfig missing/invalid, broker unreachable.
    InfraError,
    /// Catch-all for unclassified failures.
    Unknown,
}

impl ErrorCode {
    /// Stable wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::DispatchError => "dispatch_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ExecutionError => "execution_error",
            Self::ProviderError => "provider_error",
            Self::InfraError => "infra_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error object attached to every non-success result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Taxonomic failure code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail (provider response, stderr tail, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether a manual retry is expected to help.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorEnvelope {
    /// Create an envelope with just a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    /// Attach structured detail.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark the envelope retryable or not.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ValidationError).unwrap();
        assert_eq!(json, "\"validation_error\"");
        let json = serde_json::to_string(&ErrorCode::DispatchError).unwrap();
        assert_eq!(json, "\"dispatch_error\"");
    }

    #[test]
    fn error_code_round_trips_all_variants() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::DispatchError,
            ErrorCode::Timeout,
            ErrorCode::Cancelled,
            ErrorCode::ExecutionError,
            ErrorCode::ProviderError,
            ErrorCode::InfraError,
            ErrorCode::Unknown,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, code);
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn envelope_omits_empty_optionals() {
        let env = ErrorEnvelope::new(ErrorCode::Timeout, "no terminal state");
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("details"));
        assert!(!json.contains("retryable"));
    }

    #[test]
    fn envelope_carries_details_and_retryable() {
        let env = ErrorEnvelope::new(ErrorCode::ProviderError, "credentials rejected")
            .with_details(serde_json::json!({"provider": "github"}))
            .with_retryable(false);
        let json = serde_json::to_string(&env).unwrap();
        let back: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.retryable, Some(false));
    }

    #[test]
    fn envelope_display_includes_code() {
        let env = ErrorEnvelope::new(ErrorCode::InfraError, "broker unreachable");
        assert_eq!(env.to_string(), "infra_error: broker unreachable");
    }
}
