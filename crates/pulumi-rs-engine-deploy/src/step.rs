use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use pulumi_rs_engine_resource::{ResourceState, Urn};

use crate::error::StepError;
use crate::hooks::HookBindings;
use crate::provider::DiffResult;
use crate::source::{RegisterResponse, SourceError};

/// The kind of a scheduled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOp {
    Same,
    Create,
    Update,
    Delete,
    Replace,
    CreateReplacement,
    DeleteReplaced,
    Read,
    Refresh,
    Import,
}

impl StepOp {
    /// True for the ops that remove the old state.
    pub fn is_delete(&self) -> bool {
        matches!(self, StepOp::Delete | StepOp::DeleteReplaced)
    }

    /// True for the ops that produce a brand new resource.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            StepOp::Create | StepOp::CreateReplacement | StepOp::Import
        )
    }
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepOp::Same => "same",
            StepOp::Create => "create",
            StepOp::Update => "update",
            StepOp::Delete => "delete",
            StepOp::Replace => "replace",
            StepOp::CreateReplacement => "create-replacement",
            StepOp::DeleteReplaced => "delete-replaced",
            StepOp::Read => "read",
            StepOp::Refresh => "refresh",
            StepOp::Import => "import",
        };
        write!(f, "{}", s)
    }
}

/// A single scheduled unit of work against one resource.
#[derive(Clone)]
pub struct Step {
    pub op: StepOp,
    pub urn: Urn,
    /// The committed prior state, shared with the base snapshot.
    pub old: Option<Arc<ResourceState>>,
    /// The goal state. For provider-calling ops the executor fills in the
    /// id and outputs on completion.
    pub new: Option<Arc<ResourceState>>,
    /// The provider reference used for the call; empty for components and
    /// provider resources.
    pub provider: String,
    /// Changed keys, for display.
    pub keys: Vec<String>,
    pub diff: Option<DiffResult>,
    /// Set on a delete-before-replace delete: the state owes a create.
    pub pending_replace: bool,
    /// Remove from state without calling the provider (retain-on-delete,
    /// deleted-with, external reads).
    pub no_provider_call: bool,
    pub hooks: HookBindings,
}

impl Step {
    /// A minimal step over a goal state.
    pub fn new(op: StepOp, urn: Urn) -> Self {
        Self {
            op,
            urn,
            old: None,
            new: None,
            provider: String::new(),
            keys: Vec::new(),
            diff: None,
            pending_replace: false,
            no_provider_call: false,
            hooks: HookBindings::default(),
        }
    }

    /// The type token of whichever state this step operates on.
    pub fn type_token(&self) -> &str {
        self.new
            .as_deref()
            .or(self.old.as_deref())
            .map(|s| s.type_token.as_str())
            .unwrap_or("")
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("op", &self.op)
            .field("urn", &self.urn)
            .field("provider", &self.provider)
            .field("keys", &self.keys)
            .finish()
    }
}

/// A sequence of steps for one resource, submitted to the executor as a
/// single dependency cluster. Replacement chains serialize their deletes
/// and creates here; the chain completes when its last step does.
pub struct StepChain {
    /// The completion key other chains wait on.
    pub urn: Urn,
    pub steps: Vec<Step>,
    /// Completion keys this chain waits for before executing.
    pub depends: BTreeSet<Urn>,
    /// Answered when the chain finishes (registration events only).
    pub responder: Option<oneshot::Sender<Result<RegisterResponse, SourceError>>>,
    /// Whether the SDK behind the responder understands SKIP results.
    pub supports_result_reporting: bool,
    /// The chain failed before any step could be built (e.g. check
    /// failures); the executor reports it without dispatching work.
    pub failed: Option<StepError>,
}

impl StepChain {
    pub fn new(urn: Urn, steps: Vec<Step>) -> Self {
        Self {
            urn,
            steps,
            depends: BTreeSet::new(),
            responder: None,
            supports_result_reporting: false,
            failed: None,
        }
    }
}

impl fmt::Debug for StepChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepChain")
            .field("urn", &self.urn)
            .field("steps", &self.steps)
            .field("depends", &self.depends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_op_display() {
        assert_eq!(StepOp::Same.to_string(), "same");
        assert_eq!(StepOp::CreateReplacement.to_string(), "create-replacement");
        assert_eq!(StepOp::DeleteReplaced.to_string(), "delete-replaced");
    }

    #[test]
    fn test_step_op_classification() {
        assert!(StepOp::Delete.is_delete());
        assert!(StepOp::DeleteReplaced.is_delete());
        assert!(!StepOp::Update.is_delete());
        assert!(StepOp::Create.is_create());
        assert!(StepOp::Import.is_create());
        assert!(!StepOp::Same.is_create());
    }

    #[test]
    fn test_step_type_token_prefers_new() {
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
        let mut step = Step::new(StepOp::Update, urn.clone());
        assert_eq!(step.type_token(), "");
        step.old = Some(Arc::new(ResourceState::new(
            urn.clone(),
            "pkgA:index:old",
            true,
        )));
        assert_eq!(step.type_token(), "pkgA:index:old");
        step.new = Some(Arc::new(ResourceState::new(urn, "pkgA:index:new", true)));
        assert_eq!(step.type_token(), "pkgA:index:new");
    }
}
