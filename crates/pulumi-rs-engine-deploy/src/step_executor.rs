use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use pulumi_rs_engine_resource::{PropertyMap, ResourceState, Urn};

use crate::diag::{Diagnostic, Diagnostics};
use crate::error::StepError;
use crate::events::{EngineEvent, EventBus, OpSummary, StepEventMetadata};
use crate::hooks::{
    FailedOperation, HookArgs, HookDispatcher, HookStage, MAX_ERROR_HOOK_RETRIES,
};
use crate::journal::{CompletedStep, Journal};
use crate::provider::{ConstructRequest, Provider, ProviderError};
use crate::registry::ProviderRegistry;
use crate::source::{RegisterResponse, RegisterResult, SourceError};
use crate::step::{Step, StepChain, StepOp};

/// The terminal status of a chain, published to dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

struct ExecState {
    /// Completion channels per URN. Re-submitting a URN (the delete phase)
    /// replaces the entry.
    completions: HashMap<Urn, watch::Receiver<Option<StepStatus>>>,
    /// The latest committed state per URN this operation.
    committed: HashMap<Urn, Arc<ResourceState>>,
    /// Error-hook retry counters, per resource URN.
    retry_counts: HashMap<Urn, u32>,
    summary: OpSummary,
    errors: Vec<StepError>,
    diags: Diagnostics,
}

struct Shared {
    registry: Arc<ProviderRegistry>,
    journal: Arc<Journal>,
    events: EventBus,
    dispatcher: HookDispatcher,
    dry_run: bool,
    continue_on_error: bool,
    sem: Semaphore,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    state: Mutex<ExecState>,
}

/// Schedules step chains for parallel execution, honoring the dependency
/// graph and replacement ordering constraints.
///
/// A chain is dispatched once every chain it depends on has succeeded;
/// failures and skips propagate to dependents as skips. In-flight provider
/// calls are never aborted; cancellation only stops new dispatch.
pub struct StepExecutor {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        journal: Arc<Journal>,
        events: EventBus,
        parallel: usize,
        continue_on_error: bool,
        dry_run: bool,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                registry,
                journal,
                events,
                dispatcher: HookDispatcher::new(dry_run),
                dry_run,
                continue_on_error,
                sem: Semaphore::new(parallel.max(1)),
                cancel_tx,
                cancel_rx,
                state: Mutex::new(ExecState {
                    completions: HashMap::new(),
                    committed: HashMap::new(),
                    retry_counts: HashMap::new(),
                    summary: OpSummary::default(),
                    errors: Vec::new(),
                    diags: Diagnostics::new(),
                }),
            }),
            tasks: Vec::new(),
        }
    }

    /// Submits one chain for execution.
    pub fn submit(&mut self, chain: StepChain) {
        self.submit_all(vec![chain]);
    }

    /// Submits a batch, registering every completion channel before any
    /// task runs so intra-batch dependencies resolve regardless of spawn
    /// order.
    pub fn submit_all(&mut self, chains: Vec<StepChain>) {
        let mut senders = Vec::with_capacity(chains.len());
        {
            let mut state = self.shared.state.lock().unwrap();
            for chain in &chains {
                let (tx, rx) = watch::channel(None);
                state.completions.insert(chain.urn.clone(), rx);
                senders.push(tx);
            }
        }
        for (chain, tx) in chains.into_iter().zip(senders) {
            let dep_rxs: Vec<watch::Receiver<Option<StepStatus>>> = {
                let state = self.shared.state.lock().unwrap();
                chain
                    .depends
                    .iter()
                    .filter(|dep| **dep != chain.urn)
                    .filter_map(|dep| state.completions.get(dep).cloned())
                    .collect()
            };
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(async move {
                let status = run_chain(shared, chain, dep_rxs).await;
                let _ = tx.send(Some(status));
            }));
        }
    }

    /// Waits until the chains for the given URNs have reached a terminal
    /// status. URNs without a submitted chain are considered complete.
    pub async fn wait_for(&self, urns: &[Urn]) {
        let rxs: Vec<_> = {
            let state = self.shared.state.lock().unwrap();
            urns.iter()
                .filter_map(|urn| state.completions.get(urn).cloned())
                .collect()
        };
        for rx in rxs {
            let _ = await_status(rx).await;
        }
    }

    /// Stops dispatching new chains. In-flight provider calls run to
    /// completion.
    pub fn cancel(&self) {
        let _ = self.shared.cancel_tx.send(true);
    }

    /// Waits for every dispatched chain to return.
    pub async fn drain(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn summary(&self) -> OpSummary {
        self.shared.state.lock().unwrap().summary
    }

    pub fn errors(&self) -> Vec<StepError> {
        self.shared.state.lock().unwrap().errors.clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        diags.extend(self.shared.state.lock().unwrap().diags.clone());
        diags
    }

    /// The committed state for a URN, if any step has produced one.
    pub fn committed(&self, urn: &Urn) -> Option<Arc<ResourceState>> {
        self.shared.state.lock().unwrap().committed.get(urn).cloned()
    }
}

async fn await_status(mut rx: watch::Receiver<Option<StepStatus>>) -> StepStatus {
    loop {
        if let Some(status) = *rx.borrow() {
            return status;
        }
        if rx.changed().await.is_err() {
            // The task panicked or was dropped before publishing.
            return StepStatus::Failed;
        }
    }
}

fn respond(
    chain: &mut StepChain,
    result: Result<RegisterResponse, SourceError>,
) {
    if let Some(responder) = chain.responder.take() {
        let _ = responder.send(result);
    }
}

async fn run_chain(
    shared: Arc<Shared>,
    mut chain: StepChain,
    dep_rxs: Vec<watch::Receiver<Option<StepStatus>>>,
) -> StepStatus {
    // Wait for antecedents; the worst antecedent status decides whether
    // this chain runs at all.
    let mut blocked = false;
    for rx in dep_rxs {
        if await_status(rx).await != StepStatus::Succeeded {
            blocked = true;
        }
    }

    if blocked || *shared.cancel_rx.borrow() {
        let urn = chain.urn.clone();
        {
            let mut state = shared.state.lock().unwrap();
            state.summary.skipped += 1;
            if blocked {
                state
                    .diags
                    .add(Diagnostic::error(
                        Some(urn.clone()),
                        StepError::Skipped { urn: urn.clone() }.to_string(),
                    ));
            }
        }
        if chain.supports_result_reporting {
            respond(
                &mut chain,
                Ok(RegisterResponse {
                    urn,
                    id: String::new(),
                    outputs: PropertyMap::new(),
                    result: RegisterResult::Skip,
                }),
            );
        } else {
            respond(
                &mut chain,
                Err(SourceError::Registration(
                    StepError::Skipped { urn: urn.clone() }.to_string(),
                )),
            );
        }
        return StepStatus::Skipped;
    }

    // A chain that failed before any step was built (check failures).
    if let Some(failure) = chain.failed.take() {
        fail_chain(&shared, &mut chain, failure);
        return StepStatus::Failed;
    }

    let _permit = shared.sem.acquire().await.ok();

    let mut fresh_old: Option<(PropertyMap, PropertyMap)> = None;
    let steps = std::mem::take(&mut chain.steps);
    for step in steps {
        match execute_step(&shared, step, &mut fresh_old).await {
            Ok(()) => {}
            Err(failure) => {
                fail_chain(&shared, &mut chain, failure);
                return StepStatus::Failed;
            }
        }
    }

    {
        let mut state = shared.state.lock().unwrap();
        state.summary.succeeded += 1;
    }
    let committed = {
        let state = shared.state.lock().unwrap();
        state.committed.get(&chain.urn).cloned()
    };
    let response = RegisterResponse {
        urn: chain.urn.clone(),
        id: committed
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        outputs: committed
            .as_ref()
            .map(|c| c.outputs.clone())
            .unwrap_or_default(),
        result: RegisterResult::Success,
    };
    respond(&mut chain, Ok(response));
    StepStatus::Succeeded
}

fn fail_chain(shared: &Arc<Shared>, chain: &mut StepChain, failure: StepError) {
    {
        let mut state = shared.state.lock().unwrap();
        state.summary.failed += 1;
        state
            .diags
            .add(Diagnostic::error(Some(chain.urn.clone()), failure.to_string()));
        state.errors.push(failure.clone());
    }
    if !shared.continue_on_error {
        let _ = shared.cancel_tx.send(true);
    }
    respond(
        chain,
        Err(SourceError::Registration(failure.to_string())),
    );
}

fn hook_stage_before(op: StepOp) -> Option<HookStage> {
    match op {
        StepOp::Create | StepOp::CreateReplacement | StepOp::Import => {
            Some(HookStage::BeforeCreate)
        }
        StepOp::Update => Some(HookStage::BeforeUpdate),
        StepOp::Delete | StepOp::DeleteReplaced => Some(HookStage::BeforeDelete),
        _ => None,
    }
}

fn hook_stage_after(op: StepOp) -> Option<HookStage> {
    match op {
        StepOp::Create | StepOp::CreateReplacement | StepOp::Import => {
            Some(HookStage::AfterCreate)
        }
        StepOp::Update => Some(HookStage::AfterUpdate),
        StepOp::Delete | StepOp::DeleteReplaced => Some(HookStage::AfterDelete),
        _ => None,
    }
}

fn failed_operation(op: StepOp) -> FailedOperation {
    match op {
        StepOp::Update => FailedOperation::Update,
        StepOp::Delete | StepOp::DeleteReplaced => FailedOperation::Delete,
        _ => FailedOperation::Create,
    }
}

/// Builds the pruned hook payload for a stage of a step. `AfterCreate` has
/// no old values, `BeforeDelete` has no new values, and only `OnError`
/// carries the failed operation and error strings.
fn hook_args(
    step: &Step,
    stage: HookStage,
    committed: Option<&ResourceState>,
) -> HookArgs {
    let mut args = HookArgs {
        urn: Some(step.urn.clone()),
        type_token: step.type_token().to_string(),
        ..Default::default()
    };
    let old = step.old.as_deref();
    let new = step.new.as_deref();
    match stage {
        HookStage::BeforeCreate => {
            args.new_inputs = new.map(|n| n.inputs.clone());
        }
        HookStage::AfterCreate => {
            args.new_inputs = new.map(|n| n.inputs.clone());
            args.new_outputs = committed.map(|c| c.outputs.clone());
            args.id = committed.map(|c| c.id.clone()).unwrap_or_default();
        }
        HookStage::BeforeUpdate => {
            args.new_inputs = new.map(|n| n.inputs.clone());
            args.old_inputs = old.map(|o| o.inputs.clone());
            args.old_outputs = old.map(|o| o.outputs.clone());
            args.id = old.map(|o| o.id.clone()).unwrap_or_default();
        }
        HookStage::AfterUpdate => {
            args.new_inputs = new.map(|n| n.inputs.clone());
            args.new_outputs = committed.map(|c| c.outputs.clone());
            args.old_inputs = old.map(|o| o.inputs.clone());
            args.old_outputs = old.map(|o| o.outputs.clone());
            args.id = old.map(|o| o.id.clone()).unwrap_or_default();
        }
        HookStage::BeforeDelete | HookStage::AfterDelete => {
            args.old_inputs = old.map(|o| o.inputs.clone());
            args.old_outputs = old.map(|o| o.outputs.clone());
            args.id = old.map(|o| o.id.clone()).unwrap_or_default();
        }
        HookStage::OnError => {
            args.new_inputs = new.map(|n| n.inputs.clone());
            args.old_inputs = old.map(|o| o.inputs.clone());
            args.old_outputs = old.map(|o| o.outputs.clone());
            args.failed_operation = Some(failed_operation(step.op));
        }
    }
    args
}

async fn execute_step(
    shared: &Arc<Shared>,
    mut step: Step,
    fresh_old: &mut Option<(PropertyMap, PropertyMap)>,
) -> Result<(), StepError> {
    // Deletes generated without a prior state (ephemeral resources) target
    // whatever this operation committed for the URN.
    if step.op.is_delete() && step.old.is_none() {
        let committed = {
            let state = shared.state.lock().unwrap();
            state.committed.get(&step.urn).cloned()
        };
        match committed {
            Some(c) => {
                step.provider = c.provider.clone();
                step.old = Some(c);
            }
            None => return Ok(()), // nothing was created
        }
    }

    shared
        .events
        .emit(EngineEvent::ResourcePre(StepEventMetadata::from_step(&step)));

    if let Some(stage) = hook_stage_before(step.op) {
        let args = hook_args(&step, stage, None);
        if let Err(failure) = shared.dispatcher.run_before(&step.hooks, stage, &args).await {
            shared
                .journal
                .record_failure(CompletedStep::from_step(&step, None));
            shared.events.emit(EngineEvent::ResourceOperationFailed(
                StepEventMetadata::from_step(&step),
            ));
            return Err(failure);
        }
    }

    // Provider call with the OnError retry loop. Each re-execution re-runs
    // the error hooks; retries are counted per resource URN.
    let outcome = loop {
        match perform_operation(shared, &step, fresh_old).await {
            Ok(committed) => break Ok(committed),
            Err(err) => {
                let has_error_hooks = step
                    .hooks
                    .for_stage(HookStage::OnError)
                    .next()
                    .is_some();
                if !has_error_hooks && !err.is_partial() {
                    break Err(err);
                }
                let mut args = hook_args(&step, HookStage::OnError, None);
                args.errors = vec![err.to_string()];
                let mut hook_diags = Vec::new();
                let retry = shared
                    .dispatcher
                    .run_error_hooks(&step.hooks, &args, &mut hook_diags)
                    .await;
                {
                    let mut state = shared.state.lock().unwrap();
                    for diag in hook_diags {
                        state.diags.add(diag);
                    }
                }
                if !retry {
                    break Err(err);
                }
                let retries = {
                    let mut state = shared.state.lock().unwrap();
                    let count = state.retry_counts.entry(step.urn.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if retries > MAX_ERROR_HOOK_RETRIES {
                    let message = format!(
                        "maximum number of error hook retries reached for resource {}",
                        step.urn
                    );
                    let diag = Diagnostic::warning(Some(step.urn.clone()), message);
                    shared.events.diag(diag.clone());
                    shared.state.lock().unwrap().diags.add(diag);
                    break Err(ProviderError::failure(
                        StepError::RetryLimit {
                            urn: step.urn.clone(),
                        }
                        .to_string(),
                    ));
                }
            }
        }
    };

    match outcome {
        Ok(committed) => {
            // The world changed (or was confirmed): journal first, then run
            // after-hooks. Read steps that only feed a following update do
            // not touch the journal.
            if step.op != StepOp::Read || step.new.is_some() {
                shared
                    .journal
                    .record_success(CompletedStep::from_step(&step, committed.clone()));
            }
            {
                let mut state = shared.state.lock().unwrap();
                match &committed {
                    Some(c) => {
                        state.committed.insert(step.urn.clone(), c.clone());
                    }
                    None => {
                        state.committed.remove(&step.urn);
                    }
                }
            }
            if let Some(stage) = hook_stage_after(step.op) {
                let args = hook_args(&step, stage, committed.as_deref());
                let hook_diags = shared.dispatcher.run_after(&step.hooks, stage, &args).await;
                if !hook_diags.is_empty() {
                    let mut state = shared.state.lock().unwrap();
                    for diag in hook_diags {
                        state.errors.push(StepError::Provider {
                            op: "after-hook",
                            urn: step.urn.clone(),
                            message: diag.message.clone(),
                        });
                        state.diags.add(diag);
                    }
                    state.summary.failed += 1;
                }
            }
            shared.events.emit(EngineEvent::ResourceOutputs(
                StepEventMetadata::from_step(&step),
            ));
            Ok(())
        }
        Err(err) => {
            // A partial failure that assigned an id is journaled so the
            // next operation can reconcile.
            let partial = match &err {
                ProviderError::PartialFailure { id, outputs, .. } => {
                    step.new.as_ref().map(|new| {
                        let mut state = (**new).clone();
                        if let Some(id) = id {
                            state.id = id.clone();
                        }
                        state.outputs = outputs.clone();
                        Arc::new(state)
                    })
                }
                _ => None,
            };
            shared
                .journal
                .record_failure(CompletedStep::from_step(&step, partial));
            shared.events.emit(EngineEvent::ResourceOperationFailed(
                StepEventMetadata::from_step(&step),
            ));
            Err(StepError::Provider {
                op: match step.op {
                    StepOp::Update => "update",
                    StepOp::Delete | StepOp::DeleteReplaced => "delete",
                    StepOp::Read => "read",
                    StepOp::Import => "import",
                    _ => "create",
                },
                urn: step.urn.clone(),
                message: err.to_string(),
            })
        }
    }
}

fn missing<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T, ProviderError> {
    value.ok_or_else(|| ProviderError::failure(what.to_string()))
}

/// Performs the provider operation for one step and returns the committed
/// state, or `None` when the step removes the resource.
async fn perform_operation(
    shared: &Arc<Shared>,
    step: &Step,
    fresh_old: &mut Option<(PropertyMap, PropertyMap)>,
) -> Result<Option<Arc<ResourceState>>, ProviderError> {
    // Steps with no provider call just move state around.
    if step.no_provider_call || step.urn.is_provider() {
        if step.op.is_delete() {
            if step.urn.is_provider() {
                if let Some(old) = &step.old {
                    shared
                        .registry
                        .forget(&format!("{}::{}", old.urn, old.id));
                }
            }
            return Ok(None);
        }
        let committed = step.new.clone().map(|new| {
            let mut state = (*new).clone();
            match (&step.old, step.op) {
                // A Same step confirms the world; it does not touch it.
                (Some(old), StepOp::Same) => {
                    state.created = old.created;
                    state.modified = old.modified;
                }
                (old, _) => {
                    state.created = old.as_ref().and_then(|o| o.created);
                    state.stamp_modified();
                }
            }
            Arc::new(state)
        });
        return Ok(committed);
    }

    let provider = shared
        .registry
        .instance(&step.provider)
        .ok_or(ProviderError::NotConfigured)?;

    match step.op {
        StepOp::Same => Ok(step.new.clone()),
        // A remote component: the provider constructs the children and
        // returns the component's outputs. Hook bindings propagate via the
        // request's resource_hooks map.
        StepOp::Create if step.new.as_deref().is_some_and(|n| !n.custom) => {
            let new = missing(step.new.as_ref(), "construct step has no goal state")?;
            let result = provider
                .construct(ConstructRequest {
                    type_token: new.type_token.clone(),
                    name: step.urn.name().to_string(),
                    parent: new.parent.clone(),
                    inputs: new.inputs.clone(),
                    resource_hooks: new.hooks.clone(),
                })
                .await?;
            let mut state = (**new).clone();
            state.outputs = result.outputs;
            state.stamp_created();
            Ok(Some(Arc::new(state)))
        }
        StepOp::Create | StepOp::CreateReplacement => {
            let new = missing(step.new.as_ref(), "create step has no goal state")?;
            let result = provider.create(&step.urn, &new.inputs, shared.dry_run).await?;
            let handshake = shared.registry.handshake_for(&step.provider);
            let mut state = (**new).clone();
            state.id = result.id;
            state.outputs = result.outputs;
            state.refresh_before_update = handshake.supports_refresh_before_update;
            state.stamp_created();
            Ok(Some(Arc::new(state)))
        }
        StepOp::Update => {
            let new = missing(step.new.as_ref(), "update step has no goal state")?;
            let old = missing(step.old.as_ref(), "update step has no prior state")?;
            let (old_inputs, old_outputs) = match fresh_old.take() {
                Some(fresh) => fresh,
                None => (old.inputs.clone(), old.outputs.clone()),
            };
            let outputs = provider
                .update(
                    &step.urn,
                    &old.id,
                    &old_inputs,
                    &old_outputs,
                    &new.inputs,
                    shared.dry_run,
                )
                .await?;
            let handshake = shared.registry.handshake_for(&step.provider);
            let mut state = (**new).clone();
            state.id = old.id.clone();
            state.outputs = outputs;
            state.refresh_before_update = handshake.supports_refresh_before_update;
            state.created = old.created;
            state.stamp_modified();
            Ok(Some(Arc::new(state)))
        }
        StepOp::Delete | StepOp::DeleteReplaced => {
            let old = missing(step.old.as_ref(), "delete step has no prior state")?;
            if !shared.dry_run {
                provider
                    .delete(&step.urn, &old.id, &old.inputs, &old.outputs)
                    .await?;
            }
            Ok(None)
        }
        StepOp::Read => {
            match &step.new {
                // An external read resource.
                Some(new) => {
                    let result = provider
                        .read(&step.urn, &new.id, &new.inputs, &new.outputs)
                        .await?
                        .ok_or_else(|| {
                            ProviderError::failure(format!(
                                "resource {} does not exist",
                                new.id
                            ))
                        })?;
                    let mut state = (**new).clone();
                    state.id = result.id;
                    state.inputs = result.inputs;
                    state.outputs = result.outputs;
                    state.stamp_modified();
                    Ok(Some(Arc::new(state)))
                }
                // A refresh-before-update read feeding the next step.
                None => {
                    let old = missing(step.old.as_ref(), "read step has no prior state")?;
                    if let Some(result) = provider
                        .read(&step.urn, &old.id, &old.inputs, &old.outputs)
                        .await?
                    {
                        *fresh_old = Some((result.inputs, result.outputs));
                    }
                    Ok(None)
                }
            }
        }
        StepOp::Import => {
            let new = missing(step.new.as_ref(), "import step has no goal state")?;
            let result = provider
                .read(&step.urn, &new.id, &new.inputs, &PropertyMap::new())
                .await?
                .ok_or_else(|| {
                    ProviderError::failure(format!(
                        "resource with id {} does not exist",
                        new.id
                    ))
                })?;
            // Reconcile the imported state against the program's inputs: a
            // diff becomes a synthetic update.
            let diff = provider
                .diff(
                    &step.urn,
                    &result.id,
                    &result.inputs,
                    &result.outputs,
                    &new.inputs,
                    &[],
                )
                .await?;
            let mut state = (**new).clone();
            state.id = result.id.clone();
            if diff.has_changes() {
                let outputs = provider
                    .update(
                        &step.urn,
                        &result.id,
                        &result.inputs,
                        &result.outputs,
                        &new.inputs,
                        shared.dry_run,
                    )
                    .await?;
                state.outputs = outputs;
            } else {
                state.inputs = result.inputs;
                state.outputs = result.outputs;
            }
            state.stamp_created();
            Ok(Some(Arc::new(state)))
        }
        StepOp::Replace | StepOp::Refresh => {
            // Replace is a logical marker; Refresh is driven by the
            // orchestrator directly.
            Ok(step.new.clone())
        }
    }
}
