//! Container image reference parsing.
//!
//! Accepted grammar: `repo`, `repo:tag`, `repo@sha256:<64hex>`, and
//! `repo:tag@sha256:<64hex>`. Anything else is rejected before Job
//! submission with a `validation_error`.

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::DispatchError;

/// A validated image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository, possibly with a registry host and port.
    pub repository: String,
    /// Tag, when present.
    pub tag: Option<String>,
    /// `sha256:<64hex>` digest, when present.
    pub digest: Option<String>,
}

fn repository_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Host with optional port, then one or more lowercase path parts.
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
            .unwrap_or_else(|_| unreachable!("repository pattern is valid"))
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$")
            .unwrap_or_else(|_| unreachable!("tag pattern is valid"))
    })
}

fn digest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^sha256:[0-9a-f]{64}$")
            .unwrap_or_else(|_| unreachable!("digest pattern is valid"))
    })
}

impl ImageReference {
    /// Parse and validate a reference string.
    pub fn parse(reference: &str) -> Result<Self, DispatchError> {
        let malformed = |message: &str| DispatchError::MalformedImageReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        let (front, digest) = match reference.split_once('@') {
            Some((front, digest)) => {
                if !digest_pattern().is_match(digest) {
                    return Err(malformed("digest must be sha256:<64 hex chars>"));
                }
                (front, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // Split the tag off the last path segment so registry ports survive.
        let (repository, tag) = match front.rsplit_once('/') {
            Some((prefix, last)) => match last.split_once(':') {
                Some((name, tag)) => (format!("{prefix}/{name}"), Some(tag.to_string())),
                None => (front.to_string(), None),
            },
            None => match front.split_once(':') {
                Some((name, tag)) => (name.to_string(), Some(tag.to_string())),
                None => (front.to_string(), None),
            },
        };

        if repository.is_empty() || !repository_pattern().is_match(&repository) {
            return Err(malformed("invalid repository"));
        }
        if let Some(tag) = &tag
            && !tag_pattern().is_match(tag)
        {
            return Err(malformed("invalid tag"));
        }

        Ok(Self {
            repository,
            tag,
            digest,
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn bare_repository_accepted() {
        let parsed = ImageReference::parse("ghcr.io/llmctl/executor-frontier").unwrap();
        assert_eq!(parsed.repository, "ghcr.io/llmctl/executor-frontier");
        assert!(parsed.tag.is_none());
        assert!(parsed.digest.is_none());
    }

    #[test]
    fn repo_with_tag_accepted() {
        let parsed = ImageReference::parse("ghcr.io/llmctl/executor:v1.2.3").unwrap();
        assert_eq!(parsed.tag.as_deref(), Some("v1.2.3"));
    }

    #[test]
    fn repo_with_digest_accepted() {
        let parsed = ImageReference::parse(&format!("ghcr.io/llmctl/executor@{DIGEST}")).unwrap();
        assert_eq!(parsed.digest.as_deref(), Some(DIGEST));
        assert!(parsed.tag.is_none());
    }

    #[test]
    fn repo_with_tag_and_digest_accepted() {
        let parsed =
            ImageReference::parse(&format!("ghcr.io/llmctl/executor:v2@{DIGEST}")).unwrap();
        assert_eq!(parsed.tag.as_deref(), Some("v2"));
        assert_eq!(parsed.digest.as_deref(), Some(DIGEST));
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let parsed = ImageReference::parse("registry.local:5000/team/executor").unwrap();
        assert_eq!(parsed.repository, "registry.local:5000/team/executor");
        assert!(parsed.tag.is_none());
    }

    #[test]
    fn malformed_references_rejected() {
        for bad in [
            "",
            "UPPER/case",
            "repo@sha256:short",
            "repo@md5:aaaa",
            &format!("repo@{DIGEST}x"),
            "repo:tag:extra",
            "repo:",
            "repo@",
            "re po",
        ] {
            let err = ImageReference::parse(bad).unwrap_err();
            assert!(
                matches!(err, DispatchError::MalformedImageReference { .. }),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "repo",
            "repo:tag",
            &format!("repo@{DIGEST}"),
            &format!("registry.local:5000/repo:tag@{DIGEST}"),
        ] {
            assert_eq!(ImageReference::parse(text).unwrap().to_string(), *text);
        }
    }
}
