//! Credential resolution.
//!
//! The core never stores or surfaces plaintext: integration blobs live
//! encrypted in the store, decryption is delegated to a [`SecretCipher`]
//! owned by the vault layer, and the resolved value is wrapped in
//! [`Plaintext`] which redacts itself from `Debug` output and is not
//! serializable. Reads through this path happen strictly inside the
//! orchestrator/dispatcher/executor code paths.

mod mcp;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

pub use mcp::{McpIntegrationResolver, ResolvedIntegrations};

use crate::store::Store;

/// Credential resolution failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to decrypt integration {provider}/{key}: {message}")]
    Decrypt {
        provider: String,
        key: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] crate::errors::StoreError),
}

/// A decrypted secret value.
///
/// Redacted `Debug`, no `Serialize`; callers get at the bytes only via
/// [`Plaintext::expose`].
#[derive(Clone)]
pub struct Plaintext(String);

impl Plaintext {
    /// Wrap a decrypted value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext itself.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Plaintext(<redacted>)")
    }
}

/// Decrypts integration ciphertext. Owned by the vault layer; the core
/// only holds the trait object.
pub trait SecretCipher: Send + Sync {
    /// Decrypt one blob.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, String>;
}

/// Returns decrypted values by `(provider, key)`.
pub trait CredentialResolver: Send + Sync {
    /// Resolve one credential; `None` when unconfigured.
    fn resolve(&self, provider: &str, key: &str) -> Result<Option<Plaintext>, CredentialError>;
}

/// Store-backed resolver with an injected cipher.
pub struct StoreCredentialResolver {
    store: Arc<Store>,
    cipher: Arc<dyn SecretCipher>,
}

impl StoreCredentialResolver {
    /// Resolver over the given store and cipher.
    pub fn new(store: Arc<Store>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { store, cipher }
    }
}

impl CredentialResolver for StoreCredentialResolver {
    fn resolve(&self, provider: &str, key: &str) -> Result<Option<Plaintext>, CredentialError> {
        let Some(ciphertext) = self.store.get_integration(provider, key)? else {
            return Ok(None);
        };
        let value = self
            .cipher
            .decrypt(&ciphertext)
            .map_err(|message| CredentialError::Decrypt {
                provider: provider.to_string(),
                key: key.to_string(),
                message,
            })?;
        Ok(Some(Plaintext::new(value)))
    }
}

/// Fixed-map resolver for tests and single-tenant development setups.
#[derive(Default)]
pub struct StaticCredentialResolver {
    values: HashMap<(String, String), String>,
}

impl StaticCredentialResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one credential.
    pub fn with(mut self, provider: &str, key: &str, value: &str) -> Self {
        self.values
            .insert((provider.to_string(), key.to_string()), value.to_string());
        self
    }
}

impl CredentialResolver for StaticCredentialResolver {
    fn resolve(&self, provider: &str, key: &str) -> Result<Option<Plaintext>, CredentialError> {
        Ok(self
            .values
            .get(&(provider.to_string(), key.to_string()))
            .map(|v| Plaintext::new(v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rot13Cipher;

    impl SecretCipher for Rot13Cipher {
        fn decrypt(&self, ciphertext: &[u8]) -> Result<String, String> {
            let text = String::from_utf8(ciphertext.to_vec()).map_err(|e| e.to_string())?;
            Ok(text
                .chars()
                .map(|c| match c {
                    'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
                    'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
                    other => other,
                })
                .collect())
        }
    }

    #[test]
    fn plaintext_debug_is_redacted() {
        let secret = Plaintext::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Plaintext(<redacted>)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn store_resolver_decrypts_via_cipher() {
        let store = Arc::new(Store::new_in_memory().unwrap());
        store.put_integration("github", "token", b"gur-gbxra").unwrap();

        let resolver = StoreCredentialResolver::new(store, Arc::new(Rot13Cipher));
        let value = resolver.resolve("github", "token").unwrap().unwrap();
        assert_eq!(value.expose(), "the-token");
    }

    #[test]
    fn unconfigured_integration_resolves_to_none() {
        let store = Arc::new(Store::new_in_memory().unwrap());
        let resolver = StoreCredentialResolver::new(store, Arc::new(Rot13Cipher));
        assert!(resolver.resolve("github", "token").unwrap().is_none());
    }

    #[test]
    fn static_resolver_round_trip() {
        let resolver = StaticCredentialResolver::new().with("slack", "webhook", "https://hook");
        assert_eq!(
            resolver.resolve("slack", "webhook").unwrap().unwrap().expose(),
            "https://hook"
        );
        assert!(resolver.resolve("slack", "token").unwrap().is_none());
    }
}
