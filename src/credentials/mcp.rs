//! MCP server key to integration credential mapping.
//!
//! The first version is a static table: each known MCP server key names the
//! integration credentials it needs. Unknown keys map to nothing. A mapped
//! integration that is unconfigured or fails to decrypt produces a soft
//! warning; execution continues with the configured subset and the
//! warnings are appended to the run's output metadata.

use std::collections::BTreeMap;

use tracing::warn;

use super::{CredentialError, CredentialResolver, Plaintext};

/// Integration keys required by each known MCP server key.
const SERVER_INTEGRATIONS: &[(&str, &[(&str, &str)])] = &[
    ("github", &[("github", "token")]),
    ("gitlab", &[("gitlab", "token")]),
    ("slack", &[("slack", "bot_token")]),
    ("jira", &[("jira", "api_token"), ("jira", "base_url")]),
    ("postgres", &[("postgres", "dsn")]),
    ("notion", &[("notion", "api_key")]),
];

/// Effective credential bundle for one node.
pub struct ResolvedIntegrations {
    /// Configured credentials keyed by `provider/key`.
    pub configured: BTreeMap<String, Plaintext>,
    /// Soft warnings for unconfigured or invalid integrations.
    pub warnings: Vec<String>,
}

impl ResolvedIntegrations {
    /// Environment variable name for one credential key.
    pub fn env_name(provider: &str, key: &str) -> String {
        format!(
            "LLMCTL_INTEGRATION_{}_{}",
            provider.to_uppercase(),
            key.to_uppercase()
        )
    }

    /// The bundle as executor environment entries.
    pub fn as_env(&self) -> Vec<(String, String)> {
        self.configured
            .iter()
            .map(|(compound, value)| {
                let (provider, key) = compound.split_once('/').unwrap_or((compound, ""));
                (Self::env_name(provider, key), value.expose().to_string())
            })
            .collect()
    }
}

/// Computes the effective integration set for a node's MCP selection.
pub struct McpIntegrationResolver;

impl McpIntegrationResolver {
    /// Integration keys a server key maps to; empty for unknown keys.
    pub fn integrations_for(server_key: &str) -> &'static [(&'static str, &'static str)] {
        SERVER_INTEGRATIONS
            .iter()
            .find(|(key, _)| *key == server_key)
            .map(|(_, integrations)| *integrations)
            .unwrap_or(&[])
    }

    /// Resolve all credentials for the selected MCP server keys.
    pub fn resolve(
        server_keys: &[String],
        credentials: &dyn CredentialResolver,
    ) -> ResolvedIntegrations {
        let mut configured = BTreeMap::new();
        let mut warnings = Vec::new();

        for server_key in server_keys {
            let mapped = Self::integrations_for(server_key);
            if mapped.is_empty() {
                continue;
            }
            for (provider, key) in mapped {
                match credentials.resolve(provider, key) {
                    Ok(Some(value)) => {
                        configured.insert(format!("{provider}/{key}"), value);
                    }
                    Ok(None) => {
                        let message = format!(
                            "integration {provider}/{key} required by MCP server '{server_key}' is not configured"
                        );
                        warn!(server_key, provider, key, "unconfigured integration");
                        warnings.push(message);
                    }
                    Err(CredentialError::Decrypt { message, .. }) => {
                        warnings.push(format!(
                            "integration {provider}/{key} required by MCP server '{server_key}' is invalid: {message}"
                        ));
                    }
                    Err(err) => {
                        warnings.push(format!(
                            "integration {provider}/{key} required by MCP server '{server_key}' failed to resolve: {err}"
                        ));
                    }
                }
            }
        }

        ResolvedIntegrations {
            configured,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;

    #[test]
    fn known_server_maps_to_integrations() {
        assert_eq!(
            McpIntegrationResolver::integrations_for("github"),
            &[("github", "token")]
        );
        assert_eq!(McpIntegrationResolver::integrations_for("jira").len(), 2);
    }

    #[test]
    fn unknown_server_maps_to_none() {
        assert!(McpIntegrationResolver::integrations_for("made-up").is_empty());
        let resolver = StaticCredentialResolver::new();
        let resolved =
            McpIntegrationResolver::resolve(&["made-up".to_string()], &resolver);
        assert!(resolved.configured.is_empty());
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn unconfigured_integration_warns_and_continues() {
        let resolver = StaticCredentialResolver::new().with("github", "token", "tok");
        let resolved = McpIntegrationResolver::resolve(
            &["github".to_string(), "slack".to_string()],
            &resolver,
        );
        assert_eq!(resolved.configured.len(), 1);
        assert!(resolved.configured.contains_key("github/token"));
        assert_eq!(resolved.warnings.len(), 1);
        assert!(resolved.warnings[0].contains("slack/bot_token"));
    }

    #[test]
    fn bundle_exposes_env_entries() {
        let resolver = StaticCredentialResolver::new().with("github", "token", "tok");
        let resolved = McpIntegrationResolver::resolve(&["github".to_string()], &resolver);
        let env = resolved.as_env();
        assert_eq!(
            env,
            vec![("LLMCTL_INTEGRATION_GITHUB_TOKEN".to_string(), "tok".to_string())]
        );
    }
}
