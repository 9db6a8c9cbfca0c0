use std::fmt;

use serde::{Deserialize, Serialize};

use crate::urn::{Urn, UrnError};

/// Sentinel id for a provider whose id is not yet known (preview).
pub const UNKNOWN_ID: &str = "unknown-id";

/// The name prefix of engine-synthesized default providers.
pub const DEFAULT_NAME: &str = "default";

/// Errors produced while parsing provider references.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderRefError {
    #[error("could not parse provider reference {0:?}: expected \"<urn>::<id>\"")]
    MissingSeparator(String),
    #[error("could not parse provider reference {0:?}: empty id")]
    EmptyId(String),
    #[error("could not parse provider reference {0:?}: not a provider URN")]
    NotAProvider(String),
    #[error("could not parse provider reference {0:?}: {1}")]
    BadUrn(String, UrnError),
}

/// A reference to a specific configured provider instance:
/// `<provider-urn>::<provider-id>`.
///
/// Two references with different version suffixes on the URN name refer to
/// distinct provider instances even for the same package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderReference {
    urn: Urn,
    id: String,
}

impl ProviderReference {
    /// Builds a reference from an already-validated provider URN and id.
    pub fn new(urn: Urn, id: impl Into<String>) -> Self {
        Self { urn, id: id.into() }
    }

    /// Parses a `<urn>::<id>` reference string.
    pub fn parse(s: &str) -> Result<Self, ProviderRefError> {
        let (urn_str, id) = s
            .rsplit_once("::")
            .ok_or_else(|| ProviderRefError::MissingSeparator(s.to_string()))?;
        if id.is_empty() {
            return Err(ProviderRefError::EmptyId(s.to_string()));
        }
        let urn =
            Urn::parse(urn_str).map_err(|e| ProviderRefError::BadUrn(s.to_string(), e))?;
        if !urn.is_provider() {
            return Err(ProviderRefError::NotAProvider(s.to_string()));
        }
        Ok(Self {
            urn,
            id: id.to_string(),
        })
    }

    /// The provider resource's URN.
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// The provider-assigned id (or [`UNKNOWN_ID`] during preview).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The package this provider serves.
    pub fn package(&self) -> &str {
        self.urn.provider_package().unwrap_or("")
    }

    /// True when this reference names an engine-synthesized default
    /// provider.
    pub fn is_default(&self) -> bool {
        let name = self.urn.name();
        name == DEFAULT_NAME || name.starts_with("default_")
    }
}

impl fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.urn, self.id)
    }
}

impl TryFrom<String> for ProviderReference {
    type Error = ProviderRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ProviderReference::parse(&s)
    }
}

impl From<ProviderReference> for String {
    fn from(r: ProviderReference) -> String {
        r.to_string()
    }
}

/// Computes the resource name for a default provider:
/// `default` for an unversioned provider, `default_<sanitized>` otherwise.
///
/// Sanitization strips pre-release identifiers after `-` and replaces `.`
/// with `_`, so `0.17.10-dev.1` becomes `default_0_17_10`.
pub fn default_provider_name(version: Option<&str>) -> String {
    match version {
        None | Some("") => DEFAULT_NAME.to_string(),
        Some(v) => {
            let base = v.split('-').next().unwrap_or(v);
            format!("{}_{}", DEFAULT_NAME, base.replace('.', "_"))
        }
    }
}

/// Builds the URN of the default provider for `package` in the given stack
/// and project.
pub fn default_provider_urn(
    stack: &str,
    project: &str,
    package: &str,
    version: Option<&str>,
) -> Urn {
    Urn::new(
        stack,
        project,
        None,
        &format!("pulumi:providers:{}", package),
        &default_provider_name(version),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_urn() -> Urn {
        Urn::new("test", "test", None, "pulumi:providers:pkgA", "provA")
    }

    #[test]
    fn test_parse_round_trip() {
        let r = ProviderReference::new(provider_urn(), "id-1");
        let parsed = ProviderReference::parse(&r.to_string()).unwrap();
        assert_eq!(parsed, r);
        assert_eq!(parsed.package(), "pkgA");
        assert_eq!(parsed.id(), "id-1");
    }

    #[test]
    fn test_parse_missing_separator() {
        let err = ProviderReference::parse("not-a-reference").unwrap_err();
        assert!(matches!(err, ProviderRefError::MissingSeparator(_)));
    }

    #[test]
    fn test_parse_bad_urn() {
        let err = ProviderReference::parse("urn:pulumi:oops::id").unwrap_err();
        assert!(matches!(err, ProviderRefError::BadUrn(_, _)));
    }

    #[test]
    fn test_parse_non_provider_urn() {
        let err =
            ProviderReference::parse("urn:pulumi:test::test::aws:s3:Bucket::b::id").unwrap_err();
        assert!(matches!(err, ProviderRefError::NotAProvider(_)));
    }

    #[test]
    fn test_default_provider_name_unversioned() {
        assert_eq!(default_provider_name(None), "default");
        assert_eq!(default_provider_name(Some("")), "default");
    }

    #[test]
    fn test_default_provider_name_sanitizes_version() {
        assert_eq!(default_provider_name(Some("0.17.10")), "default_0_17_10");
        assert_eq!(default_provider_name(Some("0.17.11")), "default_0_17_11");
        assert_eq!(
            default_provider_name(Some("1.2.3-alpha.4")),
            "default_1_2_3"
        );
    }

    #[test]
    fn test_default_provider_urn() {
        let urn = default_provider_urn("test", "test", "pkgA", Some("0.17.10"));
        assert_eq!(
            urn.as_str(),
            "urn:pulumi:test::test::pulumi:providers:pkgA::default_0_17_10"
        );
        let r = ProviderReference::new(urn, UNKNOWN_ID);
        assert!(r.is_default());
    }

    #[test]
    fn test_explicit_provider_is_not_default() {
        let r = ProviderReference::new(provider_urn(), "id-1");
        assert!(!r.is_default());
    }
}
