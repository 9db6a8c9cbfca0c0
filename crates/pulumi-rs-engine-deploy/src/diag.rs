use std::fmt;

use pulumi_rs_engine_resource::Urn;

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

/// A diagnostic message, optionally associated with a resource.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub urn: Option<Urn>,
    pub message: String,
}

impl Diagnostic {
    /// Creates a new error diagnostic.
    pub fn error(urn: Option<Urn>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            urn,
            message: message.into(),
        }
    }

    /// Creates a new warning diagnostic.
    pub fn warning(urn: Option<Urn>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            urn,
            message: message.into(),
        }
    }

    /// Creates a new informational diagnostic.
    pub fn info(urn: Option<Urn>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            urn,
            message: message.into(),
        }
    }

    /// Returns true if this is an error-level diagnostic.
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.urn {
            Some(urn) => write!(f, "{}: {}: {}", prefix, urn, self.message),
            None => write!(f, "{}: {}", prefix, self.message),
        }
    }
}

/// A collection of diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    diags: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty diagnostics collection.
    pub fn new() -> Self {
        Self { diags: Vec::new() }
    }

    /// Adds a diagnostic.
    pub fn add(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    /// Adds an error diagnostic.
    pub fn error(&mut self, urn: Option<Urn>, message: impl Into<String>) {
        self.add(Diagnostic::error(urn, message));
    }

    /// Adds a warning diagnostic.
    pub fn warning(&mut self, urn: Option<Urn>, message: impl Into<String>) {
        self.add(Diagnostic::warning(urn, message));
    }

    /// Extends with another collection of diagnostics.
    pub fn extend(&mut self, other: Diagnostics) {
        self.diags.extend(other.diags);
    }

    /// Returns true if any error-level diagnostics are present.
    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(|d| d.is_error())
    }

    /// Returns true if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    /// Returns the number of diagnostics.
    pub fn len(&self) -> usize {
        self.diags.len()
    }

    /// Returns an iterator over the diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diags.iter()
    }

    /// Returns all diagnostics for a particular resource.
    pub fn for_urn<'a>(&'a self, urn: &'a Urn) -> impl Iterator<Item = &'a Diagnostic> {
        self.diags
            .iter()
            .filter(move |d| d.urn.as_ref() == Some(urn))
    }

    /// Consumes self and returns the inner Vec.
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diags
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diags.into_iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diag in &self.diags {
            writeln!(f, "{}", diag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error(None, "something broke");
        assert!(d.is_error());
        assert_eq!(d.to_string(), "error: something broke");

        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
        let d = Diagnostic::warning(Some(urn.clone()), "be careful");
        assert_eq!(d.to_string(), format!("warning: {}: be careful", urn));
    }

    #[test]
    fn test_diagnostics_has_errors() {
        let mut diags = Diagnostics::new();
        assert!(!diags.has_errors());
        diags.warning(None, "warn");
        assert!(!diags.has_errors());
        diags.error(None, "err");
        assert!(diags.has_errors());
    }

    #[test]
    fn test_diagnostics_for_urn() {
        let urn_a = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
        let urn_b = Urn::new("test", "test", None, "pkgA:index:typ", "resB");
        let mut diags = Diagnostics::new();
        diags.error(Some(urn_a.clone()), "a1");
        diags.error(Some(urn_b.clone()), "b1");
        diags.error(Some(urn_a.clone()), "a2");
        assert_eq!(diags.for_urn(&urn_a).count(), 2);
        assert_eq!(diags.for_urn(&urn_b).count(), 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
    }
}
