use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use pulumi_rs_engine_resource::state::HookNames;
use pulumi_rs_engine_resource::{PropertyMap, Urn};

use crate::diag::Diagnostic;
use crate::error::StepError;

/// The maximum number of times error hooks may request a retry for a single
/// resource.
pub const MAX_ERROR_HOOK_RETRIES: u32 = 100;

/// The stages a hook can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    OnError,
}

impl HookStage {
    /// The stable key used when persisting hook names in resource state.
    pub fn key(&self) -> &'static str {
        match self {
            HookStage::BeforeCreate => "before_create",
            HookStage::AfterCreate => "after_create",
            HookStage::BeforeUpdate => "before_update",
            HookStage::AfterUpdate => "after_update",
            HookStage::BeforeDelete => "before_delete",
            HookStage::AfterDelete => "after_delete",
            HookStage::OnError => "on_error",
        }
    }

    /// True for the delete-adjacent stages, which require the program to be
    /// running during destroy.
    pub fn is_delete(&self) -> bool {
        matches!(self, HookStage::BeforeDelete | HookStage::AfterDelete)
    }
}

/// The operation that failed, passed to `OnError` hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for FailedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedOperation::Create => write!(f, "create"),
            FailedOperation::Update => write!(f, "update"),
            FailedOperation::Delete => write!(f, "delete"),
        }
    }
}

/// The payload passed to a hook callback. Fields are pruned to the
/// semantically meaningful subset for the stage: `AfterCreate` carries no
/// old values, `BeforeDelete` carries no new values, and only `OnError`
/// carries `failed_operation` and `errors`.
#[derive(Debug, Clone, Default)]
pub struct HookArgs {
    pub urn: Option<Urn>,
    pub id: String,
    pub name: String,
    pub type_token: String,
    pub new_inputs: Option<PropertyMap>,
    pub old_inputs: Option<PropertyMap>,
    pub new_outputs: Option<PropertyMap>,
    pub old_outputs: Option<PropertyMap>,
    pub failed_operation: Option<FailedOperation>,
    pub errors: Vec<String>,
}

/// A hook callback's verdict. `retry` is only meaningful for `OnError`
/// hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookResponse {
    pub retry: bool,
}

/// The callback side of a hook binding.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn on_hook(&self, args: HookArgs) -> Result<HookResponse, String>;
}

/// A named hook bound to a stage of a resource's lifecycle.
#[derive(Clone)]
pub struct HookBinding {
    pub name: String,
    pub stage: HookStage,
    /// Whether the hook fires during preview.
    pub on_dry_run: bool,
    pub handler: Arc<dyn HookHandler>,
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBinding")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("on_dry_run", &self.on_dry_run)
            .finish()
    }
}

/// All hooks bound to a single resource registration.
#[derive(Debug, Clone, Default)]
pub struct HookBindings {
    bindings: Vec<HookBinding>,
}

impl HookBindings {
    pub fn new(bindings: Vec<HookBinding>) -> Self {
        Self { bindings }
    }

    pub fn push(&mut self, binding: HookBinding) {
        self.bindings.push(binding);
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The hooks bound to a stage, in registration order.
    pub fn for_stage(&self, stage: HookStage) -> impl Iterator<Item = &HookBinding> {
        self.bindings.iter().filter(move |b| b.stage == stage)
    }

    /// True when any delete-stage hook is bound.
    pub fn has_delete_hooks(&self) -> bool {
        self.bindings.iter().any(|b| b.stage.is_delete())
    }

    /// The persistable stage → names map recorded in resource state.
    pub fn names(&self) -> HookNames {
        let mut names = HookNames::new();
        for binding in &self.bindings {
            names
                .entry(binding.stage.key().to_string())
                .or_default()
                .push(binding.name.clone());
        }
        names
    }
}

/// Runs hooks around step execution and implements the error-hook retry
/// policy.
#[derive(Clone)]
pub struct HookDispatcher {
    dry_run: bool,
}

impl HookDispatcher {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn should_run(&self, binding: &HookBinding) -> bool {
        !self.dry_run || binding.on_dry_run
    }

    /// Runs the before-hooks for a stage. The first failure aborts: the
    /// step fails and the provider is never called.
    pub async fn run_before(
        &self,
        bindings: &HookBindings,
        stage: HookStage,
        args: &HookArgs,
    ) -> Result<(), StepError> {
        for binding in bindings.for_stage(stage) {
            if !self.should_run(binding) {
                continue;
            }
            let mut call = args.clone();
            call.name = binding.name.clone();
            if let Err(message) = binding.handler.on_hook(call).await {
                return Err(StepError::BeforeHook {
                    name: binding.name.clone(),
                    message,
                });
            }
        }
        Ok(())
    }

    /// Runs the after-hooks for a stage. The step's state change is already
    /// journaled; failures are reported as diagnostics.
    pub async fn run_after(
        &self,
        bindings: &HookBindings,
        stage: HookStage,
        args: &HookArgs,
    ) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for binding in bindings.for_stage(stage) {
            if !self.should_run(binding) {
                continue;
            }
            let mut call = args.clone();
            call.name = binding.name.clone();
            if let Err(message) = binding.handler.on_hook(call).await {
                diags.push(Diagnostic::error(
                    args.urn.clone(),
                    format!("hook \"{}\" failed: {}", binding.name, message),
                ));
            }
        }
        diags
    }

    /// Runs the `OnError` hooks in registration order and reports whether
    /// any requested a retry. Hook errors do not request retries but are
    /// surfaced as diagnostics.
    pub async fn run_error_hooks(
        &self,
        bindings: &HookBindings,
        args: &HookArgs,
        diags: &mut Vec<Diagnostic>,
    ) -> bool {
        let mut retry = false;
        for binding in bindings.for_stage(HookStage::OnError) {
            if !self.should_run(binding) {
                continue;
            }
            let mut call = args.clone();
            call.name = binding.name.clone();
            match binding.handler.on_hook(call).await {
                Ok(response) => retry = retry || response.retry,
                Err(message) => diags.push(Diagnostic::error(
                    args.urn.clone(),
                    format!("hook \"{}\" failed: {}", binding.name, message),
                )),
            }
        }
        retry
    }
}
