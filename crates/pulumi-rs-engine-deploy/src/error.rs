use pulumi_rs_engine_resource::provider_ref::ProviderRefError;
use pulumi_rs_engine_resource::snapshot::SnapshotError;
use pulumi_rs_engine_resource::urn::UrnError;
use pulumi_rs_engine_resource::Urn;

/// Operation-terminating errors that are not bugs: user-level conditions
/// that make continuing pointless. A bail carries a single top-level
/// message; detail travels on the diagnostic stream.
#[derive(Debug, thiserror::Error)]
pub enum BailError {
    #[error("resource {urn} is marked for protection and cannot be deleted; to unprotect it, either remove the protect option or run with a target that excludes it")]
    ProtectedDelete { urn: Urn },

    #[error("unable to replace resource \"{dependent}\" as part of replacing \"{root}\" as it is currently marked for protection")]
    ProtectedReplacement { dependent: Urn, root: Urn },

    #[error("default providers are disabled for package {package}: rpc unavailable/canceled")]
    DefaultProviderDenied { package: String },

    #[error("the replacement trigger for resource {urn} is unknown; unknown values are not allowed outside of preview")]
    UnknownReplacementTrigger { urn: Urn },

    #[error("You must run with the `--run-program` flag to use delete hooks during destroy.")]
    DeleteHooksRequireProgram,

    #[error("duplicate resource registration for {urn}")]
    DuplicateRegistration { urn: Urn },

    #[error(transparent)]
    ProviderRef(#[from] ProviderRefError),

    #[error(transparent)]
    Urn(#[from] UrnError),

    #[error("invalid provider version {version:?} for package {package}: {source}")]
    BadProviderVersion {
        package: String,
        version: String,
        source: semver::Error,
    },

    #[error("{0}")]
    Config(String),
}

/// A resource-scoped failure: the step for one resource could not complete.
/// Subject to the continue-on-error policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("hook \"{name}\" failed: {message}")]
    BeforeHook { name: String, message: String },

    #[error("{op} of resource {urn} failed: {message}")]
    Provider {
        op: &'static str,
        urn: Urn,
        message: String,
    },

    #[error("check of resource {urn} failed: {failures}")]
    CheckFailures { urn: Urn, failures: String },

    #[error("maximum number of error hook retries reached for resource {urn}")]
    RetryLimit { urn: Urn },

    #[error("resource {urn} was skipped because a resource it depends on failed")]
    Skipped { urn: Urn },
}

/// The top-level error for an operation.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Bail(#[from] BailError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("update failed: {failed} of {total} steps failed")]
    StepFailures { failed: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("test", "test", None, "pkgA:index:typ", name)
    }

    #[test]
    fn test_protected_replacement_message() {
        let err = BailError::ProtectedReplacement {
            dependent: urn("resB"),
            root: urn("resA"),
        };
        let msg = err.to_string();
        assert!(msg.contains(
            "unable to replace resource \"urn:pulumi:test::test::pkgA:index:typ::resB\""
        ));
        assert!(msg.contains(
            "as part of replacing \"urn:pulumi:test::test::pkgA:index:typ::resA\""
        ));
        assert!(msg.contains("currently marked for protection"));
    }

    #[test]
    fn test_delete_hooks_message_is_exact() {
        assert_eq!(
            BailError::DeleteHooksRequireProgram.to_string(),
            "You must run with the `--run-program` flag to use delete hooks during destroy."
        );
    }

    #[test]
    fn test_retry_limit_message() {
        let err = StepError::RetryLimit { urn: urn("resA") };
        assert!(err
            .to_string()
            .contains("maximum number of error hook retries"));
    }

    #[test]
    fn test_before_hook_message() {
        let err = StepError::BeforeHook {
            name: "validate".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "hook \"validate\" failed: boom");
    }
}
