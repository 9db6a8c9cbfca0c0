use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pulumi_rs_engine_resource::provider_ref::ProviderReference;
use pulumi_rs_engine_resource::{PropertyMap, ResourceState, Snapshot, Urn};

use crate::diag::{Diagnostic, Diagnostics};
use crate::error::{BailError, DeployError};
use crate::events::{EngineEvent, EventBus, EventSink, NoopSink, OpSummary};
use crate::hooks::HookBindings;
use crate::journal::{CompletedStep, Journal};
use crate::options::UpdateOptions;
use crate::provider::{Provider, ProviderHost};
use crate::registry::{DefaultProviderKey, ProviderRegistry};
use crate::source::{
    Program, RegisterRequest, RegisterResponse, RegisterResult, SourceError, SourceEvent,
    SourceIterator,
};
use crate::step::StepOp;
use crate::step_executor::StepExecutor;
use crate::step_generator::StepGenerator;

/// One resource in an import plan: the program resource that should adopt
/// the existing object with `id`.
#[derive(Debug, Clone)]
pub struct ImportResource {
    pub type_token: String,
    pub name: String,
    pub id: String,
}

/// The outcome of an operation. Step failures do not abandon the snapshot:
/// the journal still projects every state the operation committed, and the
/// aggregate error rides alongside.
#[derive(Debug)]
pub struct OperationResult {
    pub snapshot: Snapshot,
    pub diagnostics: Diagnostics,
    pub summary: OpSummary,
    pub error: Option<DeployError>,
}

impl OperationResult {
    /// True when every step succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Wraps one operation (update, preview, refresh, destroy, import) and
/// sequences the source iterator, step generator, step executor, and
/// journal.
pub struct Deployment {
    project: String,
    stack: String,
    opts: UpdateOptions,
    host: Arc<dyn ProviderHost>,
    sink: Arc<dyn EventSink>,
}

impl Deployment {
    pub fn new(project: &str, stack: &str, host: Arc<dyn ProviderHost>) -> Self {
        Self {
            project: project.to_string(),
            stack: stack.to_string(),
            opts: UpdateOptions::default(),
            host,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_options(mut self, opts: UpdateOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs the program and drives the world to match it.
    pub async fn update(
        &self,
        base: &Snapshot,
        program: Program,
    ) -> Result<OperationResult, DeployError> {
        self.run(base, program, Vec::new(), false).await
    }

    /// Same as update, but providers are asked in preview mode and nothing
    /// is committed; unknown values propagate through outputs.
    pub async fn preview(
        &self,
        base: &Snapshot,
        program: Program,
    ) -> Result<OperationResult, DeployError> {
        self.run(base, program, Vec::new(), true).await
    }

    /// Update combined with an import plan: listed resources are read from
    /// the provider first, then reconciled against the program's inputs.
    pub async fn import(
        &self,
        base: &Snapshot,
        program: Program,
        plan: Vec<ImportResource>,
    ) -> Result<OperationResult, DeployError> {
        self.run(base, program, plan, false).await
    }

    fn registry(&self) -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new(
            self.host.clone(),
            &self.project,
            &self.stack,
            self.opts.disable_default_providers.clone(),
        ))
    }

    /// Creates and configures instances for every provider recorded in the
    /// base snapshot, so steps against prior state (deletes, refreshes,
    /// replaced dependents) can reach their provider even when the program
    /// no longer registers it. A provider that cannot be loaded is reported
    /// and its dependents' states are left untouched.
    async fn hydrate_providers(
        &self,
        registry: &ProviderRegistry,
        base: &Snapshot,
        events: &EventBus,
    ) {
        for state in &base.resources {
            if !state.urn.is_provider() || state.id.is_empty() {
                continue;
            }
            let package = state.urn.provider_package().unwrap_or_default().to_string();
            let version = state
                .inputs
                .get("version")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            let instance = match registry.new_instance(&package, version.as_deref()) {
                Ok(instance) => instance,
                Err(e) => {
                    events.diag(Diagnostic::warning(
                        Some(state.urn.clone()),
                        format!("could not load provider for package {}: {}", package, e),
                    ));
                    continue;
                }
            };
            let reference = ProviderReference::new(state.urn.clone(), state.id.clone());
            if let Err(e) = registry.configure(&reference, instance, &state.inputs).await {
                events.diag(Diagnostic::warning(
                    Some(state.urn.clone()),
                    format!("could not configure provider {}: {}", reference, e),
                ));
            }
        }
    }

    fn request_depends(req: &RegisterRequest) -> Vec<Urn> {
        let mut deps: BTreeSet<Urn> = req.dependencies.iter().cloned().collect();
        for urns in req.property_dependencies.values() {
            deps.extend(urns.iter().cloned());
        }
        if let Some(parent) = &req.parent {
            deps.insert(parent.clone());
        }
        deps.into_iter().collect()
    }

    fn respond_cancelled(event: SourceEvent) {
        match event {
            SourceEvent::RegisterResource(_, responder) => {
                let _ = responder.send(Err(SourceError::Cancelled));
            }
            SourceEvent::RegisterResourceOutputs { done, .. } => {
                let _ = done.send(Err(SourceError::Cancelled));
            }
            SourceEvent::ReadResource(_, responder) => {
                let _ = responder.send(Err(SourceError::Cancelled));
            }
            SourceEvent::Invoke(_, responder) => {
                let _ = responder.send(Err(SourceError::Cancelled));
            }
            SourceEvent::RegisterDefaultProvider { done, .. } => {
                let _ = done.send(Err(SourceError::Cancelled));
            }
            SourceEvent::SignalAndWaitForShutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn run(
        &self,
        base: &Snapshot,
        program: Program,
        plan: Vec<ImportResource>,
        dry_run: bool,
    ) -> Result<OperationResult, DeployError> {
        let mut opts = self.opts.clone();
        opts.dry_run = dry_run;
        opts.validate()?;

        // An update with the refresh option reconciles stored state with
        // the providers first and diffs against the refreshed snapshot.
        let refreshed;
        let base = if opts.refresh && !dry_run {
            refreshed = self.refresh(base).await?;
            &refreshed.snapshot
        } else {
            base
        };

        let events = EventBus::new(self.sink.clone());
        events.emit(EngineEvent::Prelude { dry_run });

        let registry = self.registry();
        self.hydrate_providers(&registry, base, &events).await;

        let journal = Arc::new(Journal::new());
        let mut generator = StepGenerator::new(
            &self.project,
            &self.stack,
            opts.clone(),
            registry.clone(),
            events.clone(),
            base,
        );
        let base_states = generator.base_states();
        let mut executor = StepExecutor::new(
            registry.clone(),
            journal.clone(),
            events.clone(),
            opts.parallel,
            opts.continue_on_error,
            dry_run,
        );

        let import_ids: HashMap<(String, String), String> = plan
            .into_iter()
            .map(|r| ((r.type_token, r.name), r.id))
            .collect();

        let mut source = SourceIterator::start(program, &self.project, &self.stack, dry_run);
        let mut bail: Option<BailError> = None;
        let mut finalized = false;

        while let Some(event) = source.next().await {
            if bail.is_some() {
                Self::respond_cancelled(event);
                continue;
            }
            match event {
                SourceEvent::RegisterResource(mut req, responder) => {
                    if let Some(id) = import_ids.get(&(req.type_token.clone(), req.name.clone()))
                    {
                        req.import_id.get_or_insert_with(|| id.clone());
                    }
                    if !opts.parallel_diff {
                        // Diff only once the steps this registration depends
                        // on have completed.
                        executor.wait_for(&Self::request_depends(&req)).await;
                    }
                    match generator.register(req).await {
                        Ok(mut generated) => {
                            if let Some(last) = generated.chains.last_mut() {
                                last.responder = Some(responder);
                            } else {
                                let _ = responder.send(Err(SourceError::Registration(
                                    "registration produced no steps".to_string(),
                                )));
                            }
                            executor.submit_all(generated.chains);
                        }
                        Err(e) => {
                            events.diag(Diagnostic::error(None, e.to_string()));
                            let _ =
                                responder.send(Err(SourceError::Registration(e.to_string())));
                            executor.cancel();
                            bail = Some(e);
                        }
                    }
                }
                SourceEvent::RegisterResourceOutputs { urn, outputs, done } => {
                    journal.record_outputs(urn, outputs);
                    let _ = done.send(Ok(()));
                }
                SourceEvent::ReadResource(req, responder) => {
                    match generator.read(req).await {
                        Ok(mut generated) => {
                            if let Some(last) = generated.chains.last_mut() {
                                last.responder = Some(responder);
                            }
                            executor.submit_all(generated.chains);
                        }
                        Err(e) => {
                            events.diag(Diagnostic::error(None, e.to_string()));
                            let _ = responder.send(Err(SourceError::Read(e.to_string())));
                            executor.cancel();
                            bail = Some(e);
                        }
                    }
                }
                SourceEvent::Invoke(req, responder) => {
                    let result = self.invoke(&registry, &req.token, &req.args, &req.provider).await;
                    let _ = responder.send(result);
                }
                SourceEvent::RegisterDefaultProvider { reference, done } => {
                    let result = registry
                        .set_default_override(&reference)
                        .map_err(|e| SourceError::Registration(e.to_string()));
                    let _ = done.send(result);
                }
                SourceEvent::SignalAndWaitForShutdown { done } => {
                    // The explicit barrier: run delete steps while the
                    // program is still alive so delete hooks can fire.
                    executor.drain().await;
                    match generator.finalize() {
                        Ok(chains) => {
                            executor.submit_all(chains);
                            executor.drain().await;
                            finalized = true;
                        }
                        Err(e) => {
                            events.diag(Diagnostic::error(None, e.to_string()));
                            executor.cancel();
                            bail = Some(e);
                        }
                    }
                    let _ = done.send(());
                }
            }
        }

        if let Err(e) = source.join().await {
            if bail.is_none() && executor.summary().failed == 0 {
                events.diag(Diagnostic::error(None, e.to_string()));
            }
        }
        executor.drain().await;

        if !finalized && bail.is_none() {
            match generator.finalize() {
                Ok(chains) => {
                    executor.submit_all(chains);
                    executor.drain().await;
                }
                Err(e) => bail = Some(e),
            }
        }

        self.finish(base_states, &journal, &executor, &events, bail, dry_run)
    }

    async fn invoke(
        &self,
        registry: &ProviderRegistry,
        token: &str,
        args: &PropertyMap,
        provider: &Option<String>,
    ) -> Result<PropertyMap, SourceError> {
        let reference = match provider {
            Some(explicit) => explicit.clone(),
            None => {
                let package = token.split(':').next().unwrap_or(token).to_string();
                let key = DefaultProviderKey {
                    package: package.clone(),
                    version: None,
                    plugin_download_url: None,
                };
                registry
                    .lookup_default(&key)
                    .map(|r| r.to_string())
                    .ok_or_else(|| {
                        SourceError::Invoke(format!("no provider configured for {}", package))
                    })?
            }
        };
        let instance = registry
            .instance(&reference)
            .ok_or_else(|| SourceError::Invoke(format!("no provider instance {}", reference)))?;
        instance
            .invoke(token, args)
            .await
            .map_err(|e| SourceError::Invoke(e.to_string()))
    }

    fn finish(
        &self,
        base_states: Vec<Arc<ResourceState>>,
        journal: &Journal,
        executor: &StepExecutor,
        events: &EventBus,
        bail: Option<BailError>,
        dry_run: bool,
    ) -> Result<OperationResult, DeployError> {
        let summary = executor.summary();
        events.emit(EngineEvent::Summary(summary));
        let diagnostics = executor.diagnostics();

        if let Some(bail) = bail {
            events.emit(EngineEvent::Cancel);
            return Err(DeployError::Bail(bail));
        }

        let mut snapshot = journal.snap(&base_states);
        snapshot.elide_ephemeral();
        snapshot.normalize_order();
        if !dry_run {
            snapshot.verify_integrity()?;
        }

        let error = if summary.failed > 0 {
            Some(DeployError::StepFailures {
                failed: summary.failed,
                total: summary.succeeded + summary.failed + summary.skipped,
            })
        } else {
            None
        };

        Ok(OperationResult {
            snapshot,
            diagnostics,
            summary,
            error,
        })
    }

    /// Reads every custom resource in the snapshot back from its provider
    /// and projects the result as Same, Update, or Delete. With
    /// `use_legacy_refresh_diff`, only outputs are refreshed.
    pub async fn refresh(&self, base: &Snapshot) -> Result<OperationResult, DeployError> {
        let events = EventBus::new(self.sink.clone());
        events.emit(EngineEvent::Prelude {
            dry_run: self.opts.dry_run,
        });
        let registry = self.registry();
        self.hydrate_providers(&registry, base, &events).await;

        let journal = Journal::new();
        let base_states: Vec<Arc<ResourceState>> = base
            .resources
            .iter()
            .map(|s| Arc::new(s.clone()))
            .collect();
        let mut diagnostics = Diagnostics::new();
        let mut summary = OpSummary::default();

        for state in &base_states {
            if !state.custom || state.urn.is_provider() || state.delete {
                continue;
            }
            let Some(provider) = registry.instance(&state.provider) else {
                // Open contract: a missing provider is a diagnostic and the
                // state is kept untouched.
                let diag = Diagnostic::warning(
                    Some(state.urn.clone()),
                    format!("provider {} is missing; skipping refresh", state.provider),
                );
                events.diag(diag.clone());
                diagnostics.add(diag);
                continue;
            };

            match provider
                .read(&state.urn, &state.id, &state.inputs, &state.outputs)
                .await
            {
                Ok(None) => {
                    journal.record_success(CompletedStep {
                        op: StepOp::Delete,
                        urn: state.urn.clone(),
                        old: Some(state.clone()),
                        new: None,
                        pending_replace: false,
                    });
                    summary.succeeded += 1;
                }
                Ok(Some(result)) => {
                    let mut refreshed = (**state).clone();
                    refreshed.outputs = result.outputs;
                    if !self.opts.use_legacy_refresh_diff {
                        refreshed.inputs = result.inputs;
                        refreshed.id = result.id;
                    }
                    let op = if refreshed == **state {
                        StepOp::Same
                    } else {
                        StepOp::Refresh
                    };
                    journal.record_success(CompletedStep {
                        op,
                        urn: state.urn.clone(),
                        old: Some(state.clone()),
                        new: Some(Arc::new(refreshed)),
                        pending_replace: false,
                    });
                    summary.succeeded += 1;
                }
                Err(e) => {
                    let diag = Diagnostic::error(
                        Some(state.urn.clone()),
                        format!("refresh of {} failed: {}", state.urn, e),
                    );
                    events.diag(diag.clone());
                    diagnostics.add(diag);
                    summary.failed += 1;
                }
            }
        }

        events.emit(EngineEvent::Summary(summary));
        let mut snapshot = journal.snap(&base_states);
        snapshot.normalize_order();
        snapshot.verify_integrity()?;
        let error = if summary.failed > 0 {
            Some(DeployError::StepFailures {
                failed: summary.failed,
                total: summary.succeeded + summary.failed,
            })
        } else {
            None
        };
        Ok(OperationResult {
            snapshot,
            diagnostics,
            summary,
            error,
        })
    }

    /// Deletes every resource in the snapshot in reverse topological order.
    /// With `run_program`, the program runs first purely to discover hook
    /// bindings; its registrations are answered from prior state and
    /// discarded.
    pub async fn destroy(
        &self,
        base: &Snapshot,
        program: Option<Program>,
    ) -> Result<OperationResult, DeployError> {
        let events = EventBus::new(self.sink.clone());
        events.emit(EngineEvent::Prelude { dry_run: false });
        let registry = self.registry();
        self.hydrate_providers(&registry, base, &events).await;

        let journal = Arc::new(Journal::new());
        let opts = UpdateOptions {
            dry_run: false,
            ..self.opts.clone()
        };
        let mut generator = StepGenerator::new(
            &self.project,
            &self.stack,
            opts.clone(),
            registry.clone(),
            events.clone(),
            base,
        );
        let base_states = generator.base_states();

        let mut hooks_by_urn: HashMap<Urn, HookBindings> = HashMap::new();
        match program {
            Some(program) if opts.run_program => {
                let mut source =
                    SourceIterator::start(program, &self.project, &self.stack, false);
                while let Some(event) = source.next().await {
                    match event {
                        SourceEvent::RegisterResource(req, responder) => {
                            let urn = Urn::new(
                                &self.stack,
                                &self.project,
                                None,
                                &req.type_token,
                                &req.name,
                            );
                            if !req.hooks.is_empty() {
                                hooks_by_urn.insert(urn.clone(), req.hooks.clone());
                            }
                            let prior = base.resource(&urn);
                            let _ = responder.send(Ok(RegisterResponse {
                                urn: urn.clone(),
                                id: prior.map(|p| p.id.clone()).unwrap_or_default(),
                                outputs: prior.map(|p| p.outputs.clone()).unwrap_or_default(),
                                result: RegisterResult::Success,
                            }));
                        }
                        other => Self::respond_cancelled(other),
                    }
                }
                let _ = source.join().await;
            }
            _ => {
                // Without the program there is nobody to serve delete
                // hooks; their presence in state is an error.
                for state in &base.resources {
                    let has_delete_hooks = state.hooks.contains_key("before_delete")
                        || state.hooks.contains_key("after_delete");
                    if has_delete_hooks {
                        return Err(DeployError::Bail(BailError::DeleteHooksRequireProgram));
                    }
                }
            }
        }

        for (urn, hooks) in hooks_by_urn {
            generator.attach_hooks(urn, hooks);
        }

        let mut executor = StepExecutor::new(
            registry,
            journal.clone(),
            events.clone(),
            opts.parallel,
            opts.continue_on_error,
            false,
        );
        let bail = match generator.finalize() {
            Ok(chains) => {
                executor.submit_all(chains);
                executor.drain().await;
                None
            }
            Err(e) => Some(e),
        };

        self.finish(base_states, &journal, &executor, &events, bail, false)
    }
}
