use std::sync::Arc;

use async_trait::async_trait;

use pulumi_rs_engine_resource::state::HookNames;
use pulumi_rs_engine_resource::{PropertyMap, Urn};

/// The input key under which the engine stashes its own bookkeeping
/// (plugin download URL, checksums, parameterization). Filtered out before
/// a provider sees its configuration.
pub const INTERNAL_KEY: &str = "__internal";

/// Errors returned by provider operations.
///
/// `PartialFailure` means the provider did (or may have) changed the world:
/// any assigned id and partial outputs must be persisted so the next
/// operation can reconcile.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{message}")]
    Failure { message: String },

    #[error("partial failure: {message}")]
    PartialFailure {
        message: String,
        id: Option<String>,
        outputs: PropertyMap,
    },

    #[error("provider is not configured")]
    NotConfigured,

    #[error("plugin unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn failure(message: impl Into<String>) -> Self {
        ProviderError::Failure {
            message: message.into(),
        }
    }

    /// True when the error indicates a partially applied change.
    pub fn is_partial(&self) -> bool {
        matches!(self, ProviderError::PartialFailure { .. })
    }
}

/// Capabilities negotiated with a provider before first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeResponse {
    pub supports_refresh_before_update: bool,
}

/// A single input validation failure from `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}

/// The result of checking inputs: the inputs all downstream comparisons
/// use, plus any validation failures.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub inputs: PropertyMap,
    pub failures: Vec<CheckFailure>,
}

impl CheckResult {
    pub fn ok(inputs: PropertyMap) -> Self {
        Self {
            inputs,
            failures: Vec::new(),
        }
    }
}

/// Whether a diff found changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffChanges {
    None,
    Some,
}

/// The result of diffing old state against new inputs.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub changes: DiffChanges,
    /// Keys whose change forces a replacement.
    pub replace_keys: Vec<String>,
    /// All keys that changed.
    pub changed_keys: Vec<String>,
    /// Output keys known to be stable across the change.
    pub stables: Vec<String>,
    /// Provider hint: the replacement must delete before creating.
    pub delete_before_replace: bool,
}

impl DiffResult {
    pub fn no_changes() -> Self {
        Self {
            changes: DiffChanges::None,
            replace_keys: Vec::new(),
            changed_keys: Vec::new(),
            stables: Vec::new(),
            delete_before_replace: false,
        }
    }

    pub fn changed(changed_keys: Vec<String>) -> Self {
        Self {
            changes: DiffChanges::Some,
            replace_keys: Vec::new(),
            changed_keys,
            stables: Vec::new(),
            delete_before_replace: false,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.changes == DiffChanges::Some
    }

    /// True when the provider itself requires a replacement.
    pub fn requires_replacement(&self) -> bool {
        !self.replace_keys.is_empty()
    }
}

/// The result of creating a resource.
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub id: String,
    pub outputs: PropertyMap,
}

/// The result of reading a resource. `None` from `read` means the resource
/// no longer exists.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

/// A request to construct a remote component. Hook bindings attached to
/// the component registration are propagated so the component provider can
/// attach them to the children it registers.
#[derive(Debug, Clone)]
pub struct ConstructRequest {
    pub type_token: String,
    pub name: String,
    pub parent: Option<Urn>,
    pub inputs: PropertyMap,
    pub resource_hooks: HookNames,
}

/// The result of constructing a remote component.
#[derive(Debug, Clone)]
pub struct ConstructResult {
    pub urn: Urn,
    pub outputs: PropertyMap,
}

/// The contract between the engine and a resource provider.
///
/// One value of this trait represents one provider *instance*: `configure`
/// is called at most once, before any other resource operation. Providers
/// must tolerate concurrent calls for distinct resources.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Negotiates engine/provider capabilities.
    async fn handshake(&self) -> Result<HandshakeResponse, ProviderError> {
        Ok(HandshakeResponse::default())
    }

    /// Validates provider configuration inputs.
    async fn check_config(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        let _ = (urn, olds);
        Ok(CheckResult::ok(news.clone()))
    }

    /// Diffs provider configuration.
    async fn diff_config(
        &self,
        urn: &Urn,
        old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
    ) -> Result<DiffResult, ProviderError> {
        let _ = urn;
        if old_inputs == new_inputs {
            Ok(DiffResult::no_changes())
        } else {
            let changed: Vec<String> = new_inputs
                .iter()
                .filter(|(k, v)| old_inputs.get(*k) != Some(v))
                .map(|(k, _)| k.clone())
                .chain(
                    old_inputs
                        .keys()
                        .filter(|k| !new_inputs.contains_key(*k))
                        .cloned(),
                )
                .collect();
            Ok(DiffResult {
                changes: DiffChanges::Some,
                replace_keys: changed.clone(),
                changed_keys: changed,
                stables: Vec::new(),
                delete_before_replace: false,
            })
        }
    }

    /// Applies configuration to this instance.
    async fn configure(&self, inputs: &PropertyMap) -> Result<(), ProviderError>;

    /// Validates resource inputs, returning the checked inputs.
    async fn check(
        &self,
        urn: &Urn,
        olds: Option<&PropertyMap>,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError>;

    /// Diffs a resource's old state against its new checked inputs.
    async fn diff(
        &self,
        urn: &Urn,
        id: &str,
        old_inputs: &PropertyMap,
        old_outputs: &PropertyMap,
        new_inputs: &PropertyMap,
        ignore_changes: &[String],
    ) -> Result<DiffResult, ProviderError>;

    /// Creates a resource. During preview no real resource is created and
    /// unknown outputs are returned instead.
    async fn create(
        &self,
        urn: &Urn,
        inputs: &PropertyMap,
        preview: bool,
    ) -> Result<CreateResult, ProviderError>;

    /// Reads the current live state of a resource.
    async fn read(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        outputs: &PropertyMap,
    ) -> Result<Option<ReadResult>, ProviderError>;

    /// Updates a resource, returning its new outputs.
    async fn update(
        &self,
        urn: &Urn,
        id: &str,
        old_inputs: &PropertyMap,
        old_outputs: &PropertyMap,
        new_inputs: &PropertyMap,
        preview: bool,
    ) -> Result<PropertyMap, ProviderError>;

    /// Deletes a resource.
    async fn delete(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        outputs: &PropertyMap,
    ) -> Result<(), ProviderError>;

    /// Constructs a remote component resource.
    async fn construct(&self, req: ConstructRequest) -> Result<ConstructResult, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "provider does not support remote components (construct of {})",
            req.type_token
        )))
    }

    /// Invokes a provider function.
    async fn invoke(
        &self,
        token: &str,
        args: &PropertyMap,
    ) -> Result<PropertyMap, ProviderError> {
        let _ = args;
        Err(ProviderError::Unavailable(format!(
            "provider does not support invoke ({})",
            token
        )))
    }
}

/// Loads fresh provider instances for a package. Each call returns a new,
/// unconfigured instance; during a provider replacement the engine keeps
/// two instances of the same package alive side by side.
pub trait ProviderHost: Send + Sync {
    fn new_instance(
        &self,
        package: &str,
        version: Option<&semver::Version>,
    ) -> Result<Arc<dyn Provider>, ProviderError>;
}
