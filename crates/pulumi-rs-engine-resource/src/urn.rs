use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed prefix of every URN.
pub const URN_PREFIX: &str = "urn:pulumi:";

/// The separator between URN components.
const URN_SEP: &str = "::";

/// The separator between a parent type chain and the resource's own type.
const TYPE_SEP: char = '$';

/// Errors produced while parsing or constructing URNs.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UrnError {
    #[error("invalid URN {0:?}: missing \"urn:pulumi:\" prefix")]
    MissingPrefix(String),
    #[error("invalid URN {0:?}: expected 4 \"::\"-separated components, found {1}")]
    WrongComponentCount(String, usize),
    #[error("invalid URN {0:?}: empty {1} component")]
    EmptyComponent(String, &'static str),
    #[error("invalid type token {0:?}: expected \"package:module:Name\"")]
    InvalidTypeToken(String),
}

/// The hierarchical identity of a resource within a stack:
/// `urn:pulumi:<stack>::<project>::<qualified type>::<name>`.
///
/// The qualified type is the chain of ancestor types joined with `$`,
/// ending with the resource's own type token. URNs are stored in canonical
/// string form; component accessors slice into that string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Builds a URN from its components. `parent_type` is the qualified type
    /// of the parent, or `None` for a top-level resource.
    pub fn new(stack: &str, project: &str, parent_type: Option<&str>, type_token: &str, name: &str) -> Self {
        let qualified = match parent_type {
            Some(pt) if !pt.is_empty() => format!("{}{}{}", pt, TYPE_SEP, type_token),
            _ => type_token.to_string(),
        };
        Urn(format!(
            "{URN_PREFIX}{stack}::{project}::{qualified}::{name}"
        ))
    }

    /// Parses and validates a URN from its canonical string form.
    pub fn parse(s: &str) -> Result<Self, UrnError> {
        let rest = s
            .strip_prefix(URN_PREFIX)
            .ok_or_else(|| UrnError::MissingPrefix(s.to_string()))?;
        let parts: Vec<&str> = rest.split(URN_SEP).collect();
        if parts.len() != 4 {
            return Err(UrnError::WrongComponentCount(s.to_string(), parts.len()));
        }
        for (part, what) in parts.iter().zip(["stack", "project", "type", "name"]) {
            if part.is_empty() {
                return Err(UrnError::EmptyComponent(s.to_string(), what));
            }
        }
        // Every segment of the type chain must be a package:module:Name token.
        for token in parts[2].split(TYPE_SEP) {
            if token.split(':').count() != 3 {
                return Err(UrnError::InvalidTypeToken(token.to_string()));
            }
        }
        Ok(Urn(s.to_string()))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn component(&self, idx: usize) -> &str {
        self.0[URN_PREFIX.len()..]
            .split(URN_SEP)
            .nth(idx)
            .unwrap_or("")
    }

    /// The stack name.
    pub fn stack(&self) -> &str {
        self.component(0)
    }

    /// The project name.
    pub fn project(&self) -> &str {
        self.component(1)
    }

    /// The full `$`-joined type chain.
    pub fn qualified_type(&self) -> &str {
        self.component(2)
    }

    /// The resource's own type token (last segment of the chain).
    pub fn type_token(&self) -> &str {
        self.qualified_type()
            .rsplit(TYPE_SEP)
            .next()
            .unwrap_or("")
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        self.component(3)
    }

    /// True when the URN names a provider resource (`pulumi:providers:<pkg>`).
    pub fn is_provider(&self) -> bool {
        self.type_token().starts_with("pulumi:providers:")
    }

    /// For provider URNs, the package the provider serves.
    pub fn provider_package(&self) -> Option<&str> {
        self.type_token().strip_prefix("pulumi:providers:")
    }

    /// Rewrites the type chain, keeping stack/project/name. Used when
    /// computing alias URNs for a renamed type.
    pub fn with_qualified_type(&self, qualified_type: &str) -> Urn {
        Urn(format!(
            "{URN_PREFIX}{}::{}::{}::{}",
            self.stack(),
            self.project(),
            qualified_type,
            self.name()
        ))
    }

    /// Rewrites the name, keeping everything else. Used when computing alias
    /// URNs for a renamed resource.
    pub fn with_name(&self, name: &str) -> Urn {
        Urn(format!(
            "{URN_PREFIX}{}::{}::{}::{}",
            self.stack(),
            self.project(),
            self.qualified_type(),
            name
        ))
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Urn({})", self.0)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> String {
        urn.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_new_top_level() {
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
        assert_eq!(urn.as_str(), "urn:pulumi:test::test::pkgA:index:typ::resA");
        assert_eq!(urn.stack(), "test");
        assert_eq!(urn.project(), "test");
        assert_eq!(urn.qualified_type(), "pkgA:index:typ");
        assert_eq!(urn.type_token(), "pkgA:index:typ");
        assert_eq!(urn.name(), "resA");
    }

    #[test]
    fn test_urn_new_with_parent_type() {
        let urn = Urn::new(
            "dev",
            "proj",
            Some("my:component:Comp"),
            "pkgA:index:typ",
            "child",
        );
        assert_eq!(
            urn.as_str(),
            "urn:pulumi:dev::proj::my:component:Comp$pkgA:index:typ::child"
        );
        assert_eq!(urn.qualified_type(), "my:component:Comp$pkgA:index:typ");
        assert_eq!(urn.type_token(), "pkgA:index:typ");
    }

    #[test]
    fn test_urn_parse_round_trip() {
        let s = "urn:pulumi:test::test::pkgA:index:typ::resA";
        let urn = Urn::parse(s).unwrap();
        assert_eq!(urn.as_str(), s);
    }

    #[test]
    fn test_urn_parse_missing_prefix() {
        let err = Urn::parse("test::test::pkgA:index:typ::resA").unwrap_err();
        assert!(matches!(err, UrnError::MissingPrefix(_)));
    }

    #[test]
    fn test_urn_parse_wrong_component_count() {
        let err = Urn::parse("urn:pulumi:test::test::resA").unwrap_err();
        assert!(matches!(err, UrnError::WrongComponentCount(_, 3)));
    }

    #[test]
    fn test_urn_parse_empty_name() {
        let err = Urn::parse("urn:pulumi:test::test::pkgA:index:typ::").unwrap_err();
        assert!(matches!(err, UrnError::EmptyComponent(_, "name")));
    }

    #[test]
    fn test_urn_parse_bad_type_token() {
        let err = Urn::parse("urn:pulumi:test::test::notatoken::resA").unwrap_err();
        assert!(matches!(err, UrnError::InvalidTypeToken(_)));
    }

    #[test]
    fn test_urn_provider_detection() {
        let urn = Urn::new("test", "test", None, "pulumi:providers:aws", "default");
        assert!(urn.is_provider());
        assert_eq!(urn.provider_package(), Some("aws"));

        let urn = Urn::new("test", "test", None, "aws:s3:Bucket", "b");
        assert!(!urn.is_provider());
        assert_eq!(urn.provider_package(), None);
    }

    #[test]
    fn test_urn_alias_rewrites() {
        let urn = Urn::new("test", "test", None, "pkgA:index:old", "resA");
        let retyped = urn.with_qualified_type("pkgA:index:new");
        assert_eq!(
            retyped.as_str(),
            "urn:pulumi:test::test::pkgA:index:new::resA"
        );
        let renamed = urn.with_name("resB");
        assert_eq!(
            renamed.as_str(),
            "urn:pulumi:test::test::pkgA:index:old::resB"
        );
    }
}
