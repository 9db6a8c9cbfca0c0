//! Scriptable providers, hooks, and programs for exercising the lifecycle
//! executor in tests.
//!
//! The test provider records every call and returns pre-queued results,
//! auto-generating placeholder results when the queues are empty. All
//! instances created by one [`TestProviderHost`] share the same recorder,
//! so assertions can observe calls across provider replacements. Checked
//! inputs and create outputs are round-tripped through the
//! `google.protobuf.Struct` wire form, like a plugin host would, so every
//! lifecycle test also proves wrapper identity survives marshaling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pulumi_rs_engine_resource::marshal::{map_to_struct, struct_to_map};
use pulumi_rs_engine_resource::{PropertyMap, PropertyValue, Urn};

use crate::hooks::{HookArgs, HookBinding, HookHandler, HookResponse, HookStage};
use crate::provider::{
    CheckResult, ConstructRequest, ConstructResult, CreateResult, DiffChanges, DiffResult,
    HandshakeResponse, Provider, ProviderError, ProviderHost, ReadResult,
};
use crate::source::{Program, ProgramContext, RegisterRequest, SourceError};

/// Per-package behavior knobs for the test provider.
#[derive(Debug, Clone, Default)]
pub struct TestProviderConfig {
    pub supports_refresh_before_update: bool,
    /// Input keys whose change forces replacement.
    pub replace_keys: Vec<String>,
    /// When replacing, ask for delete-before-replace.
    pub delete_before_replace: bool,
    /// Every create (past the queued results) returns a partial failure
    /// with an assigned id.
    pub always_partial_create: bool,
}

/// A recorded create call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub instance: usize,
    pub urn: Urn,
    pub inputs: PropertyMap,
    pub preview: bool,
}

/// A recorded update call.
#[derive(Debug, Clone)]
pub struct UpdateCall {
    pub instance: usize,
    pub urn: Urn,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub new_inputs: PropertyMap,
}

/// A recorded delete call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub instance: usize,
    pub urn: Urn,
    pub id: String,
}

/// A recorded read call.
#[derive(Debug, Clone)]
pub struct ReadCall {
    pub instance: usize,
    pub urn: Urn,
    pub id: String,
}

#[derive(Debug, Default)]
struct RecordedInner {
    configures: Vec<(usize, PropertyMap)>,
    checks: Vec<Urn>,
    diffs: Vec<Urn>,
    creates: Vec<CreateCall>,
    updates: Vec<UpdateCall>,
    deletes: Vec<DeleteCall>,
    reads: Vec<ReadCall>,
}

/// Calls recorded across every instance of a host. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordedCalls {
    inner: Arc<Mutex<RecordedInner>>,
}

impl RecordedCalls {
    pub fn configure_calls(&self) -> Vec<PropertyMap> {
        self.inner
            .lock()
            .unwrap()
            .configures
            .iter()
            .map(|(_, inputs)| inputs.clone())
            .collect()
    }

    /// Configure calls with the instance that served each, for asserting
    /// which configured instance handled later operations.
    pub fn configure_calls_with_instance(&self) -> Vec<(usize, PropertyMap)> {
        self.inner.lock().unwrap().configures.clone()
    }

    pub fn checks(&self) -> Vec<Urn> {
        self.inner.lock().unwrap().checks.clone()
    }

    pub fn diffs(&self) -> Vec<Urn> {
        self.inner.lock().unwrap().diffs.clone()
    }

    pub fn creates(&self) -> Vec<CreateCall> {
        self.inner.lock().unwrap().creates.clone()
    }

    pub fn updates(&self) -> Vec<UpdateCall> {
        self.inner.lock().unwrap().updates.clone()
    }

    pub fn deletes(&self) -> Vec<DeleteCall> {
        self.inner.lock().unwrap().deletes.clone()
    }

    pub fn reads(&self) -> Vec<ReadCall> {
        self.inner.lock().unwrap().reads.clone()
    }
}

type CreateQueue = Arc<Mutex<VecDeque<Result<CreateResult, ProviderError>>>>;
type ReadQueue = Arc<Mutex<VecDeque<Option<ReadResult>>>>;

/// One provider instance handed out by [`TestProviderHost`].
#[derive(Debug)]
pub struct TestProvider {
    instance: usize,
    config: TestProviderConfig,
    recorded: RecordedCalls,
    create_results: CreateQueue,
    read_results: ReadQueue,
    id_counter: Arc<AtomicU32>,
}

impl TestProvider {
    fn auto_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("id-{:04x}", n)
    }
}

#[async_trait]
impl Provider for TestProvider {
    async fn handshake(&self) -> Result<HandshakeResponse, ProviderError> {
        Ok(HandshakeResponse {
            supports_refresh_before_update: self.config.supports_refresh_before_update,
        })
    }

    async fn configure(&self, inputs: &PropertyMap) -> Result<(), ProviderError> {
        self.recorded
            .inner
            .lock()
            .unwrap()
            .configures
            .push((self.instance, inputs.clone()));
        Ok(())
    }

    async fn check(
        &self,
        urn: &Urn,
        _olds: Option<&PropertyMap>,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        self.recorded.inner.lock().unwrap().checks.push(urn.clone());
        // Cross the plugin wire: checked inputs come back from the
        // Struct encoding a real provider host would produce.
        Ok(CheckResult::ok(struct_to_map(&map_to_struct(news))))
    }

    async fn diff(
        &self,
        urn: &Urn,
        _id: &str,
        old_inputs: &PropertyMap,
        _old_outputs: &PropertyMap,
        new_inputs: &PropertyMap,
        ignore_changes: &[String],
    ) -> Result<DiffResult, ProviderError> {
        self.recorded.inner.lock().unwrap().diffs.push(urn.clone());

        let mut changed: Vec<String> = Vec::new();
        for (k, v) in new_inputs {
            if ignore_changes.contains(k) {
                continue;
            }
            if old_inputs.get(k) != Some(v) {
                changed.push(k.clone());
            }
        }
        for k in old_inputs.keys() {
            if !new_inputs.contains_key(k) && !ignore_changes.contains(k) {
                changed.push(k.clone());
            }
        }

        if changed.is_empty() {
            return Ok(DiffResult::no_changes());
        }
        let replace_keys: Vec<String> = changed
            .iter()
            .filter(|k| self.config.replace_keys.contains(k))
            .cloned()
            .collect();
        Ok(DiffResult {
            changes: DiffChanges::Some,
            delete_before_replace: self.config.delete_before_replace
                && !replace_keys.is_empty(),
            replace_keys,
            changed_keys: changed,
            stables: Vec::new(),
        })
    }

    async fn create(
        &self,
        urn: &Urn,
        inputs: &PropertyMap,
        preview: bool,
    ) -> Result<CreateResult, ProviderError> {
        self.recorded.inner.lock().unwrap().creates.push(CreateCall {
            instance: self.instance,
            urn: urn.clone(),
            inputs: inputs.clone(),
            preview,
        });

        if preview {
            let mut outputs = inputs.clone();
            outputs.insert("id".to_string(), PropertyValue::Computed);
            return Ok(CreateResult {
                id: String::new(),
                outputs: struct_to_map(&map_to_struct(&outputs)),
            });
        }
        if let Some(result) = self.create_results.lock().unwrap().pop_front() {
            return result;
        }
        if self.config.always_partial_create {
            return Err(ProviderError::PartialFailure {
                message: "create was interrupted".to_string(),
                id: Some(self.auto_id()),
                outputs: inputs.clone(),
            });
        }
        Ok(CreateResult {
            id: self.auto_id(),
            outputs: struct_to_map(&map_to_struct(inputs)),
        })
    }

    async fn read(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        outputs: &PropertyMap,
    ) -> Result<Option<ReadResult>, ProviderError> {
        self.recorded.inner.lock().unwrap().reads.push(ReadCall {
            instance: self.instance,
            urn: urn.clone(),
            id: id.to_string(),
        });

        if let Some(result) = self.read_results.lock().unwrap().pop_front() {
            return Ok(result);
        }
        Ok(Some(ReadResult {
            id: id.to_string(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        }))
    }

    async fn update(
        &self,
        urn: &Urn,
        _id: &str,
        old_inputs: &PropertyMap,
        old_outputs: &PropertyMap,
        new_inputs: &PropertyMap,
        _preview: bool,
    ) -> Result<PropertyMap, ProviderError> {
        self.recorded.inner.lock().unwrap().updates.push(UpdateCall {
            instance: self.instance,
            urn: urn.clone(),
            old_inputs: old_inputs.clone(),
            old_outputs: old_outputs.clone(),
            new_inputs: new_inputs.clone(),
        });
        Ok(new_inputs.clone())
    }

    async fn delete(
        &self,
        urn: &Urn,
        id: &str,
        _inputs: &PropertyMap,
        _outputs: &PropertyMap,
    ) -> Result<(), ProviderError> {
        self.recorded.inner.lock().unwrap().deletes.push(DeleteCall {
            instance: self.instance,
            urn: urn.clone(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn construct(&self, req: ConstructRequest) -> Result<ConstructResult, ProviderError> {
        let urn = Urn::new("test", "test", None, &req.type_token, &req.name);
        Ok(ConstructResult {
            urn,
            outputs: req.inputs,
        })
    }
}

/// Hands out [`TestProvider`] instances. All instances share one recorder
/// and one result queue, so scripted results are consumed in call order
/// regardless of which instance serves the call.
pub struct TestProviderHost {
    recorded: RecordedCalls,
    configs: Mutex<HashMap<String, TestProviderConfig>>,
    create_results: CreateQueue,
    read_results: ReadQueue,
    id_counter: Arc<AtomicU32>,
    instances: AtomicUsize,
}

impl TestProviderHost {
    pub fn new() -> Self {
        Self {
            recorded: RecordedCalls::default(),
            configs: Mutex::new(HashMap::new()),
            create_results: Arc::new(Mutex::new(VecDeque::new())),
            read_results: Arc::new(Mutex::new(VecDeque::new())),
            id_counter: Arc::new(AtomicU32::new(0)),
            instances: AtomicUsize::new(0),
        }
    }

    /// Sets behavior knobs for every instance serving `package`.
    pub fn set_config(&self, package: &str, config: TestProviderConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(package.to_string(), config);
    }

    /// Queues a create result, consumed in call order.
    pub fn queue_create(&self, result: Result<CreateResult, ProviderError>) {
        self.create_results.lock().unwrap().push_back(result);
    }

    /// Queues a read result, consumed in call order. `None` means the
    /// resource is gone.
    pub fn queue_read(&self, result: Option<ReadResult>) {
        self.read_results.lock().unwrap().push_back(result);
    }

    /// The shared call recorder.
    pub fn recorded(&self) -> RecordedCalls {
        self.recorded.clone()
    }

    /// How many instances have been handed out.
    pub fn instance_count(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

impl Default for TestProviderHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHost for TestProviderHost {
    fn new_instance(
        &self,
        package: &str,
        _version: Option<&semver::Version>,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let instance = self.instances.fetch_add(1, Ordering::SeqCst);
        let config = self
            .configs
            .lock()
            .unwrap()
            .get(package)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(TestProvider {
            instance,
            config,
            recorded: self.recorded.clone(),
            create_results: self.create_results.clone(),
            read_results: self.read_results.clone(),
            id_counter: self.id_counter.clone(),
        }))
    }
}

/// A hook handler that records its calls and replays queued responses,
/// falling back to a configurable default.
pub struct ScriptedHook {
    calls: Mutex<Vec<HookArgs>>,
    responses: Mutex<VecDeque<Result<HookResponse, String>>>,
    fallback: Result<HookResponse, String>,
}

impl ScriptedHook {
    /// A hook that succeeds without requesting retries.
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            fallback: Ok(HookResponse { retry: false }),
        })
    }

    /// A hook that always requests a retry.
    pub fn retrying() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            fallback: Ok(HookResponse { retry: true }),
        })
    }

    /// A hook that always fails with the given message.
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            fallback: Err(message.to_string()),
        })
    }

    /// Queues a response consumed before the fallback applies.
    pub fn queue(&self, response: Result<HookResponse, String>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// The recorded calls.
    pub fn calls(&self) -> Vec<HookArgs> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HookHandler for ScriptedHook {
    async fn on_hook(&self, args: HookArgs) -> Result<HookResponse, String> {
        self.calls.lock().unwrap().push(args);
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => self.fallback.clone(),
        }
    }
}

/// Builds a hook binding that fires during preview as well.
pub fn hook(name: &str, stage: HookStage, handler: Arc<dyn HookHandler>) -> HookBinding {
    HookBinding {
        name: name.to_string(),
        stage,
        on_dry_run: true,
        handler,
    }
}

/// A registration request for a custom resource with string inputs.
pub fn custom_resource(
    type_token: &str,
    name: &str,
    inputs: &[(&str, &str)],
) -> RegisterRequest {
    let mut map = PropertyMap::new();
    for (k, v) in inputs {
        map.insert(k.to_string(), PropertyValue::string(*v));
    }
    RegisterRequest {
        type_token: type_token.to_string(),
        name: name.to_string(),
        custom: true,
        inputs: map,
        ..Default::default()
    }
}

/// A program that plays a fixed list of registrations in order, failing the
/// program when a registration fails.
pub fn program_of(requests: Vec<RegisterRequest>) -> Program {
    Box::new(move |ctx: ProgramContext| {
        Box::pin(async move {
            for req in requests {
                ctx.register_resource(req).await?;
            }
            Ok(())
        })
    })
}

/// A program built from a closure, for tests that need responses.
pub fn program_fn<F, Fut>(f: F) -> Program
where
    F: FnOnce(ProgramContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), SourceError>> + Send + 'static,
{
    Box::new(move |ctx: ProgramContext| Box::pin(f(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provider_auto_generates_create_results() {
        let host = TestProviderHost::new();
        let provider = host.new_instance("pkgA", None).unwrap();
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");

        let result = provider
            .create(&urn, &PropertyMap::new(), false)
            .await
            .unwrap();
        assert!(!result.id.is_empty());
        assert_eq!(host.recorded().creates().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_uses_queued_create_results() {
        let host = TestProviderHost::new();
        host.queue_create(Err(ProviderError::PartialFailure {
            message: "interrupted".to_string(),
            id: Some("id-partial".to_string()),
            outputs: PropertyMap::new(),
        }));
        let provider = host.new_instance("pkgA", None).unwrap();
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");

        let err = provider
            .create(&urn, &PropertyMap::new(), false)
            .await
            .unwrap_err();
        assert!(err.is_partial());
        // Queue exhausted: next create succeeds.
        assert!(provider.create(&urn, &PropertyMap::new(), false).await.is_ok());
    }

    #[tokio::test]
    async fn test_provider_diff_honors_ignore_changes() {
        let host = TestProviderHost::new();
        let provider = host.new_instance("pkgA", None).unwrap();
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");

        let mut old = PropertyMap::new();
        old.insert("A".to_string(), PropertyValue::string("foo"));
        let mut new = PropertyMap::new();
        new.insert("A".to_string(), PropertyValue::string("bar"));

        let diff = provider
            .diff(&urn, "id", &old, &old, &new, &["A".to_string()])
            .await
            .unwrap();
        assert!(!diff.has_changes());

        let diff = provider.diff(&urn, "id", &old, &old, &new, &[]).await.unwrap();
        assert!(diff.has_changes());
        assert_eq!(diff.changed_keys, vec!["A"]);
    }

    #[tokio::test]
    async fn test_instances_share_recorder() {
        let host = TestProviderHost::new();
        let a = host.new_instance("pkgA", None).unwrap();
        let b = host.new_instance("pkgA", None).unwrap();
        let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");

        a.delete(&urn, "id-a", &PropertyMap::new(), &PropertyMap::new())
            .await
            .unwrap();
        b.delete(&urn, "id-b", &PropertyMap::new(), &PropertyMap::new())
            .await
            .unwrap();

        let deletes = host.recorded().deletes();
        assert_eq!(deletes.len(), 2);
        assert_ne!(deletes[0].instance, deletes[1].instance);
        assert_eq!(host.instance_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_hook_replays_then_falls_back() {
        let hook = ScriptedHook::retrying();
        hook.queue(Ok(HookResponse { retry: false }));

        let first = hook.on_hook(HookArgs::default()).await.unwrap();
        assert!(!first.retry);
        let second = hook.on_hook(HookArgs::default()).await.unwrap();
        assert!(second.retry);
        assert_eq!(hook.calls().len(), 2);
    }
}
