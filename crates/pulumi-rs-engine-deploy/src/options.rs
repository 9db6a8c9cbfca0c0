use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use pulumi_rs_engine_resource::Urn;

use crate::error::BailError;

/// Options governing a single operation. Deserializable so a deployment
/// settings file can populate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UpdateOptions {
    /// Maximum number of steps executing concurrently. Always at least 1.
    pub parallel: usize,
    /// Allow the diff phase of a registration to run before the steps of
    /// the resources it depends on have completed.
    pub parallel_diff: bool,
    /// Keep executing independent subtrees after a step failure.
    pub continue_on_error: bool,
    /// Refresh resource state from providers before diffing.
    pub refresh: bool,
    /// During refresh, compare outputs only (legacy behavior).
    pub use_legacy_refresh_diff: bool,
    /// When set, only matching resources are operated on; everything else
    /// produces Same steps.
    pub targets: Option<Vec<String>>,
    /// Package names (or "*") for which default providers are denied.
    pub disable_default_providers: Vec<String>,
    /// For destroy: run the program first to discover hook bindings.
    pub run_program: bool,
    /// Preview mode: providers are asked in preview mode and nothing is
    /// committed.
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            parallel: 8,
            parallel_diff: false,
            continue_on_error: false,
            refresh: false,
            use_legacy_refresh_diff: false,
            targets: None,
            disable_default_providers: Vec::new(),
            run_program: false,
            dry_run: false,
        }
    }
}

impl UpdateOptions {
    /// Parses options from a YAML settings document.
    pub fn from_yaml(source: &str) -> Result<Self, BailError> {
        let opts: UpdateOptions =
            serde_yaml::from_str(source).map_err(|e| BailError::Config(e.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Validates option values.
    pub fn validate(&self) -> Result<(), BailError> {
        if self.parallel < 1 {
            return Err(BailError::Config(
                "parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the target matcher, if targets were supplied.
    pub fn target_set(&self) -> Option<TargetSet> {
        self.targets.as_ref().map(|t| TargetSet::new(t))
    }

    /// True when default providers are denied for the given package.
    pub fn default_provider_disabled(&self, package: &str) -> bool {
        self.disable_default_providers
            .iter()
            .any(|p| p == "*" || p == package)
    }
}

/// A set of URN patterns. A pattern is either a full URN or a prefix
/// followed by `*`.
#[derive(Debug, Clone)]
pub struct TargetSet {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl TargetSet {
    pub fn new(patterns: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut prefixes = Vec::new();
        for pattern in patterns {
            match pattern.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => {
                    exact.insert(pattern.clone());
                }
            }
        }
        Self { exact, prefixes }
    }

    /// True when the URN matches one of the patterns.
    pub fn matches(&self, urn: &Urn) -> bool {
        self.exact.contains(urn.as_str())
            || self.prefixes.iter().any(|p| urn.as_str().starts_with(p))
    }
}
