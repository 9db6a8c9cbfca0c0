use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use pulumi_rs_engine_resource::{PropertyMap, PropertyValue, Urn};

use crate::hooks::HookBindings;

/// Errors surfaced to the program through registration responses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("resource registration failed: {0}")]
    Registration(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("invoke failed: {0}")]
    Invoke(String),
    #[error("the resource monitor was cancelled")]
    Cancelled,
}

/// A request to register a resource with the engine. Mirrors the fields of
/// the registration protocol.
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub type_token: String,
    pub name: String,
    pub custom: bool,
    pub remote: bool,
    pub parent: Option<Urn>,
    /// Explicit provider reference (`<urn>::<id>`).
    pub provider: Option<String>,
    /// Per-package provider overrides, inherited by component children.
    pub providers: BTreeMap<String, String>,
    pub inputs: PropertyMap,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    pub alias_urns: Vec<Urn>,
    pub version: Option<String>,
    pub plugin_download_url: Option<String>,
    pub protect: bool,
    pub retain_on_delete: bool,
    pub delete_before_replace: Option<bool>,
    pub replace_on_changes: Vec<String>,
    pub deleted_with: Option<Urn>,
    pub ignore_changes: Vec<String>,
    pub ephemeral: bool,
    /// Whether the SDK can receive per-resource results (SUCCESS/FAIL/SKIP).
    pub supports_result_reporting: bool,
    pub hooks: HookBindings,
    /// A user-supplied value whose change forces replacement.
    pub replacement_trigger: Option<PropertyValue>,
    /// When set, adopt the existing resource with this id instead of
    /// creating one.
    pub import_id: Option<String>,
}

/// The per-resource outcome reported back to the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Success,
    Fail,
    Skip,
}

/// The engine's response to a resource registration or read.
#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub urn: Urn,
    pub id: String,
    pub outputs: PropertyMap,
    pub result: RegisterResult,
}

/// A request to read an existing resource without managing it.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub type_token: String,
    pub name: String,
    pub parent: Option<Urn>,
    pub provider: Option<String>,
    pub id: String,
    pub inputs: PropertyMap,
}

/// A request to invoke a provider function.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    pub token: String,
    pub args: PropertyMap,
    pub provider: Option<String>,
}

/// One event surfaced by the source iterator. Each event carries the
/// responder the engine uses to answer the program.
pub enum SourceEvent {
    RegisterResource(
        RegisterRequest,
        oneshot::Sender<Result<RegisterResponse, SourceError>>,
    ),
    RegisterResourceOutputs {
        urn: Urn,
        outputs: PropertyMap,
        done: oneshot::Sender<Result<(), SourceError>>,
    },
    ReadResource(
        ReadRequest,
        oneshot::Sender<Result<RegisterResponse, SourceError>>,
    ),
    Invoke(
        InvokeRequest,
        oneshot::Sender<Result<PropertyMap, SourceError>>,
    ),
    RegisterDefaultProvider {
        reference: String,
        done: oneshot::Sender<Result<(), SourceError>>,
    },
    /// The program requests that pending delete steps run while it is still
    /// alive (needed for delete hooks), then waits for shutdown.
    SignalAndWaitForShutdown {
        done: oneshot::Sender<()>,
    },
}

/// The handle a program uses to talk to the engine. Cheap to clone; sends
/// are strictly ordered per task and may interleave across tasks.
#[derive(Clone)]
pub struct ProgramContext {
    tx: mpsc::Sender<SourceEvent>,
    pub project: String,
    pub stack: String,
    pub dry_run: bool,
}

impl ProgramContext {
    /// Registers a resource and waits for its step to complete.
    pub async fn register_resource(
        &self,
        req: RegisterRequest,
    ) -> Result<RegisterResponse, SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::RegisterResource(req, tx))
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)?
    }

    /// Registers outputs for an already-registered resource (typically a
    /// component).
    pub async fn register_resource_outputs(
        &self,
        urn: Urn,
        outputs: PropertyMap,
    ) -> Result<(), SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::RegisterResourceOutputs {
                urn,
                outputs,
                done: tx,
            })
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)?
    }

    /// Reads an external resource.
    pub async fn read_resource(
        &self,
        req: ReadRequest,
    ) -> Result<RegisterResponse, SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::ReadResource(req, tx))
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)?
    }

    /// Invokes a provider function.
    pub async fn invoke(&self, req: InvokeRequest) -> Result<PropertyMap, SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::Invoke(req, tx))
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)?
    }

    /// Registers a default provider override for a package.
    pub async fn register_default_provider(
        &self,
        reference: impl Into<String>,
    ) -> Result<(), SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::RegisterDefaultProvider {
                reference: reference.into(),
                done: tx,
            })
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)?
    }

    /// Requests that delete steps run now and waits for the engine to wind
    /// down.
    pub async fn signal_and_wait_for_shutdown(&self) -> Result<(), SourceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SourceEvent::SignalAndWaitForShutdown { done: tx })
            .await
            .map_err(|_| SourceError::Cancelled)?;
        rx.await.map_err(|_| SourceError::Cancelled)
    }
}

/// A deployment program: an async function driven against a
/// [`ProgramContext`].
pub type Program = Box<
    dyn FnOnce(ProgramContext) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send>>
        + Send,
>;

/// The engine side of the registration channel: a lazy, finite sequence of
/// source events, exhausted when the program completes and the channel
/// drains.
pub struct SourceIterator {
    rx: mpsc::Receiver<SourceEvent>,
    program: Option<JoinHandle<Result<(), SourceError>>>,
}

impl SourceIterator {
    /// Starts a program and returns the event stream it produces.
    pub fn start(program: Program, project: &str, stack: &str, dry_run: bool) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let ctx = ProgramContext {
            tx,
            project: project.to_string(),
            stack: stack.to_string(),
            dry_run,
        };
        let handle = tokio::spawn(program(ctx));
        Self {
            rx,
            program: Some(handle),
        }
    }

    /// Returns the next event, or `None` once the program has completed and
    /// every event has been consumed.
    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }

    /// Waits for the program to finish and reports its result.
    pub async fn join(&mut self) -> Result<(), SourceError> {
        match self.program.take() {
            Some(handle) => handle.await.unwrap_or(Err(SourceError::Cancelled)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_iterator_orders_events() {
        let program: Program = Box::new(|ctx: ProgramContext| {
            Box::pin(async move {
                ctx.register_resource(RegisterRequest {
                    type_token: "pkgA:index:typ".to_string(),
                    name: "resA".to_string(),
                    custom: true,
                    ..Default::default()
                })
                .await?;
                Ok(())
            })
        });

        let mut source = SourceIterator::start(program, "test", "test", false);
        match source.next().await {
            Some(SourceEvent::RegisterResource(req, responder)) => {
                assert_eq!(req.name, "resA");
                let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
                responder
                    .send(Ok(RegisterResponse {
                        urn,
                        id: "id-1".to_string(),
                        outputs: PropertyMap::new(),
                        result: RegisterResult::Success,
                    }))
                    .ok();
            }
            _ => panic!("expected a registration event"),
        }
        assert!(source.next().await.is_none());
        source.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_responder_surfaces_cancellation() {
        let program: Program = Box::new(|ctx: ProgramContext| {
            Box::pin(async move {
                let err = ctx
                    .register_resource(RegisterRequest {
                        type_token: "pkgA:index:typ".to_string(),
                        name: "resA".to_string(),
                        custom: true,
                        ..Default::default()
                    })
                    .await
                    .unwrap_err();
                assert!(matches!(err, SourceError::Cancelled));
                Ok(())
            })
        });

        let mut source = SourceIterator::start(program, "test", "test", false);
        match source.next().await {
            Some(SourceEvent::RegisterResource(_, responder)) => drop(responder),
            _ => panic!("expected a registration event"),
        }
        assert!(source.next().await.is_none());
        source.join().await.unwrap();
    }
}
