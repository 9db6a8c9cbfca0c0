use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use pulumi_rs_engine_resource::provider_ref::{ProviderReference, UNKNOWN_ID};
use pulumi_rs_engine_resource::{PropertyMap, PropertyValue, ResourceState, Snapshot, Urn};

use crate::error::{BailError, StepError};
use crate::events::EventBus;
use crate::hooks::HookBindings;
use crate::options::{TargetSet, UpdateOptions};
use crate::provider::{DiffResult, Provider, ProviderError};
use crate::registry::{DefaultProviderKey, ProviderRegistry};
use crate::source::{ReadRequest, RegisterRequest};
use crate::step::{Step, StepChain, StepOp};

/// What the generator remembers about each registration this run, used for
/// option inheritance by later children.
struct RegisteredInfo {
    custom: bool,
    ephemeral: bool,
    deleted_with: Option<Urn>,
    providers: BTreeMap<String, String>,
    qualified_type: String,
    parent: Option<Urn>,
}

/// Turns incoming resource registrations into step chains by diffing
/// against prior state and honoring user directives.
///
/// The generator is driven sequentially by the source iterator; the chains
/// it emits execute concurrently under the step executor's scheduling
/// rules.
pub struct StepGenerator {
    project: String,
    stack: String,
    opts: UpdateOptions,
    targets: Option<TargetSet>,
    registry: Arc<ProviderRegistry>,
    events: EventBus,

    /// Live prior states not yet claimed by a registration.
    olds: HashMap<Urn, Arc<ResourceState>>,
    /// Every base state in snapshot order, shared with the journal.
    base: Vec<Arc<ResourceState>>,
    /// Plain pending-delete tombstones from the base snapshot.
    pending_deletes: Vec<Arc<ResourceState>>,
    /// Tombstones owing a replacement create.
    pending_replacements: HashMap<Urn, Arc<ResourceState>>,

    registered: HashMap<Urn, RegisteredInfo>,
    /// URNs registered as ephemeral this run, in creation order.
    ephemeral_order: Vec<Urn>,
    ephemerals: BTreeSet<Urn>,
    /// Old states deleted ahead of time by a delete-before-replace chain,
    /// awaiting their replacement registration.
    deleted_for_replacement: HashMap<Urn, Arc<ResourceState>>,
    /// Hook bindings seen this run, for delete steps generated later.
    resource_hooks: HashMap<Urn, HookBindings>,
    /// Deferred deletes of replaced resources (create-before-delete mode).
    deferred_deletes: Vec<Step>,
}

/// The product of one registration: zero or more injected provider chains
/// followed by the resource's own chain.
pub struct GeneratedChains {
    pub chains: Vec<StepChain>,
}

impl StepGenerator {
    pub fn new(
        project: &str,
        stack: &str,
        opts: UpdateOptions,
        registry: Arc<ProviderRegistry>,
        events: EventBus,
        base_snapshot: &Snapshot,
    ) -> Self {
        let mut olds = HashMap::new();
        let mut base = Vec::new();
        let mut pending_deletes = Vec::new();
        let mut pending_replacements = HashMap::new();

        for state in &base_snapshot.resources {
            let shared = Arc::new(state.clone());
            base.push(shared.clone());
            if state.delete {
                if state.pending_replacement {
                    pending_replacements.insert(state.urn.clone(), shared);
                } else {
                    pending_deletes.push(shared);
                }
            } else {
                olds.insert(state.urn.clone(), shared);
            }
        }

        Self {
            project: project.to_string(),
            stack: stack.to_string(),
            targets: opts.target_set(),
            opts,
            registry,
            events,
            olds,
            base,
            pending_deletes,
            pending_replacements,
            registered: HashMap::new(),
            ephemeral_order: Vec::new(),
            ephemerals: BTreeSet::new(),
            deleted_for_replacement: HashMap::new(),
            resource_hooks: HashMap::new(),
            deferred_deletes: Vec::new(),
        }
    }

    /// The base states shared with the journal for carryover.
    pub fn base_states(&self) -> Vec<Arc<ResourceState>> {
        self.base.clone()
    }

    fn dry_run(&self) -> bool {
        self.opts.dry_run
    }

    /// Computes the `$`-joined type chain for a resource under its parent.
    fn qualified_type(&self, parent: Option<&Urn>, type_token: &str) -> String {
        match parent {
            Some(parent_urn) => {
                let parent_qt = self
                    .registered
                    .get(parent_urn)
                    .map(|info| info.qualified_type.clone())
                    .unwrap_or_else(|| parent_urn.qualified_type().to_string());
                format!("{}${}", parent_qt, type_token)
            }
            None => type_token.to_string(),
        }
    }

    fn make_urn(&self, req: &RegisterRequest) -> Urn {
        let qt = self.qualified_type(req.parent.as_ref(), &req.type_token);
        Urn::new(&self.stack, &self.project, None, &qt, &req.name)
    }

    /// Walks the parent chain collecting inherited options. `ephemeral`
    /// inherits from any ancestor; `deleted_with` and the `providers` map
    /// inherit from component ancestors only, and a custom-resource parent
    /// ends that part of the chain.
    fn inherit(&self, req: &RegisterRequest) -> (bool, Option<Urn>, BTreeMap<String, String>) {
        let mut ephemeral = req.ephemeral;
        let mut deleted_with = req.deleted_with.clone();
        let mut providers = req.providers.clone();
        let mut component_chain = true;

        let mut cursor = req.parent.clone();
        while let Some(parent_urn) = cursor.take() {
            let Some(info) = self.registered.get(&parent_urn) else {
                break;
            };
            ephemeral = ephemeral || info.ephemeral;
            if info.custom {
                component_chain = false;
            }
            if component_chain {
                if deleted_with.is_none() {
                    deleted_with = info.deleted_with.clone();
                }
                for (pkg, reference) in &info.providers {
                    providers
                        .entry(pkg.clone())
                        .or_insert_with(|| reference.clone());
                }
            }
            cursor = info.parent.clone();
        }
        (ephemeral, deleted_with, providers)
    }

    fn package_of(type_token: &str) -> &str {
        type_token.split(':').next().unwrap_or(type_token)
    }

    /// Resolves the provider reference for a custom resource, injecting a
    /// default provider chain when needed.
    async fn resolve_provider(
        &mut self,
        req: &RegisterRequest,
        inherited_providers: &BTreeMap<String, String>,
        chains: &mut Vec<StepChain>,
    ) -> Result<ProviderReference, BailError> {
        if let Some(explicit) = &req.provider {
            return Ok(ProviderReference::parse(explicit)?);
        }
        let package = Self::package_of(&req.type_token).to_string();
        if let Some(inherited) = inherited_providers.get(&package) {
            return Ok(ProviderReference::parse(inherited)?);
        }

        let key = DefaultProviderKey {
            package: package.clone(),
            version: req.version.clone(),
            plugin_download_url: req.plugin_download_url.clone(),
        };
        if let Some(reference) = self.registry.lookup_default(&key) {
            return Ok(reference);
        }
        self.registry.check_default_allowed(&package)?;

        // Synthesize the default provider and inject its chain ahead of the
        // dependent resource.
        let urn = self.registry.default_provider_urn(&key);
        let mut inputs = PropertyMap::new();
        if let Some(version) = &key.version {
            inputs.insert("version".to_string(), PropertyValue::string(version.clone()));
        }
        if let Some(url) = &key.plugin_download_url {
            inputs.insert(
                "pluginDownloadURL".to_string(),
                PropertyValue::string(url.clone()),
            );
        }

        let chain = self
            .provider_resource_chain(urn.clone(), &package, key.version.as_deref(), inputs, None)
            .await?;
        let reference = ProviderReference::parse(&chain.1)?;
        self.registry.note_default(key, reference.clone());
        chains.push(chain.0);
        Ok(reference)
    }

    /// Builds the chain for a provider resource (explicit or default) and
    /// configures its instance. Returns the chain and the reference string
    /// dependents should record.
    async fn provider_resource_chain(
        &mut self,
        urn: Urn,
        package: &str,
        version: Option<&str>,
        inputs: PropertyMap,
        req: Option<&RegisterRequest>,
    ) -> Result<(StepChain, String), BailError> {
        let instance = self.registry.new_instance(package, version)?;
        let old = self.olds.remove(&urn);

        let old_inputs = old
            .as_ref()
            .map(|o| o.inputs.clone())
            .unwrap_or_default();
        let checked = instance
            .check_config(&urn, &old_inputs, &inputs)
            .await
            .map_err(|e| BailError::Config(e.to_string()))?;

        let (op, id, old_for_step) = match &old {
            None => {
                let id = if self.dry_run() {
                    UNKNOWN_ID.to_string()
                } else {
                    Uuid::new_v4().to_string()
                };
                (StepOp::Create, id, None)
            }
            Some(old_state) => {
                let diff = instance
                    .diff_config(&urn, &old_state.inputs, &checked.inputs)
                    .await
                    .map_err(|e| BailError::Config(e.to_string()))?;
                if diff.requires_replacement() {
                    let id = if self.dry_run() {
                        UNKNOWN_ID.to_string()
                    } else {
                        Uuid::new_v4().to_string()
                    };
                    (StepOp::CreateReplacement, id, Some(old_state.clone()))
                } else if diff.has_changes() {
                    (StepOp::Update, old_state.id.clone(), Some(old_state.clone()))
                } else {
                    (StepOp::Same, old_state.id.clone(), Some(old_state.clone()))
                }
            }
        };

        let reference = ProviderReference::new(urn.clone(), id.clone());
        self.registry
            .configure(&reference, instance, &checked.inputs)
            .await
            .map_err(|e| BailError::Config(e.to_string()))?;

        let mut state = ResourceState::new(urn.clone(), urn.type_token(), true);
        state.id = id;
        state.inputs = checked.inputs.clone();
        state.outputs = checked.inputs;
        if let Some(r) = req {
            state.protect = r.protect;
            state.aliases = r.alias_urns.clone();
        }

        // Replacing a provider defers the old instance's delete to the end
        // of the operation; the old instance stays alive and configured so
        // it can delete its old dependents.
        if op == StepOp::CreateReplacement {
            if let Some(old_state) = &old_for_step {
                let mut delete = Step::new(StepOp::DeleteReplaced, old_state.urn.clone());
                delete.old = Some(old_state.clone());
                delete.no_provider_call = true;
                self.deferred_deletes.push(delete);
            }
        }

        let mut step = Step::new(op, urn.clone());
        step.old = old_for_step;
        step.new = Some(Arc::new(state));
        step.no_provider_call = true;

        self.registered.insert(
            urn.clone(),
            RegisteredInfo {
                custom: true,
                ephemeral: false,
                deleted_with: None,
                providers: BTreeMap::new(),
                qualified_type: urn.qualified_type().to_string(),
                parent: None,
            },
        );

        let reference_str = reference.to_string();
        Ok((StepChain::new(urn, vec![step]), reference_str))
    }

    /// Normalizes a replacement trigger: secrets and known outputs are
    /// transparent. Returns `None` when the trigger is unknown.
    fn normalize_trigger(value: &PropertyValue) -> Option<PropertyValue> {
        if value.contains_unknowns() {
            None
        } else {
            Some(value.unwrap().clone())
        }
    }

    /// Processes one `register-resource` event into step chains.
    pub async fn register(
        &mut self,
        req: RegisterRequest,
    ) -> Result<GeneratedChains, BailError> {
        let urn = self.make_urn(&req);
        if self.registered.contains_key(&urn) {
            return Err(BailError::DuplicateRegistration { urn });
        }

        let mut chains = Vec::new();

        // Alias resolution: a prior state found under an alias URN is
        // re-homed to the new URN.
        let mut old = self.olds.remove(&urn);
        if old.is_none() {
            for alias in &req.alias_urns {
                if let Some(aliased) = self.olds.remove(alias) {
                    old = Some(aliased);
                    break;
                }
            }
        }
        let pending_replacement = self.pending_replacements.remove(&urn);

        let (ephemeral, deleted_with, inherited_providers) = self.inherit(&req);

        // Provider resources take the dedicated path.
        if urn.is_provider() {
            let package = urn.provider_package().unwrap_or_default().to_string();
            // Re-home the old state so the provider chain diffs against it.
            if let Some(o) = old {
                self.olds.insert(urn.clone(), o);
            }
            let (mut chain, _reference) = self
                .provider_resource_chain(
                    urn.clone(),
                    &package,
                    req.version.as_deref(),
                    req.inputs.clone(),
                    Some(&req),
                )
                .await?;
            chain.supports_result_reporting = req.supports_result_reporting;
            chains.push(chain);
            return Ok(GeneratedChains { chains });
        }

        // Remote components need a provider for their construct call.
        let provider_ref = if req.custom || req.remote {
            Some(
                self.resolve_provider(&req, &inherited_providers, &mut chains)
                    .await?,
            )
        } else {
            None
        };

        // Targeted operations leave everything else untouched.
        if let Some(targets) = &self.targets {
            if !targets.matches(&urn) {
                let chain = self.same_chain(&urn, &req, old, ephemeral);
                chains.push(chain);
                return Ok(GeneratedChains { chains });
            }
        }

        // Check produces the inputs used for every downstream comparison.
        let (checked_inputs, check_failure) = match (&provider_ref, req.custom) {
            (Some(reference), true) => {
                let provider = self.registry.instance(&reference.to_string());
                match provider {
                    Some(provider) => {
                        let olds_inputs = old.as_ref().map(|o| o.inputs.clone());
                        match provider
                            .check(&urn, olds_inputs.as_ref(), &req.inputs)
                            .await
                        {
                            Ok(result) if result.failures.is_empty() => (result.inputs, None),
                            Ok(result) => {
                                let failures = result
                                    .failures
                                    .iter()
                                    .map(|f| format!("{}: {}", f.property, f.reason))
                                    .collect::<Vec<_>>()
                                    .join("; ");
                                (
                                    result.inputs,
                                    Some(StepError::CheckFailures {
                                        urn: urn.clone(),
                                        failures,
                                    }),
                                )
                            }
                            Err(e) => (
                                req.inputs.clone(),
                                Some(StepError::Provider {
                                    op: "check",
                                    urn: urn.clone(),
                                    message: e.to_string(),
                                }),
                            ),
                        }
                    }
                    None => (
                        req.inputs.clone(),
                        Some(StepError::Provider {
                            op: "check",
                            urn: urn.clone(),
                            message: ProviderError::NotConfigured.to_string(),
                        }),
                    ),
                }
            }
            _ => (req.inputs.clone(), None),
        };

        self.note_registered(&urn, &req, ephemeral, &deleted_with, &inherited_providers);
        if ephemeral {
            self.ephemerals.insert(urn.clone());
            self.ephemeral_order.push(urn.clone());
        }
        if !req.hooks.is_empty() {
            self.resource_hooks.insert(urn.clone(), req.hooks.clone());
        }

        if let Some(failure) = check_failure {
            let mut chain = StepChain::new(urn.clone(), Vec::new());
            chain.failed = Some(failure);
            chain.supports_result_reporting = req.supports_result_reporting;
            chains.push(chain);
            return Ok(GeneratedChains { chains });
        }

        let new_state = self.goal_state(
            &urn,
            &req,
            checked_inputs,
            provider_ref.as_ref(),
            ephemeral,
            deleted_with,
        );

        let chain = self
            .classify(&urn, &req, old, pending_replacement, new_state)
            .await?;
        chains.push(chain);
        Ok(GeneratedChains { chains })
    }

    fn note_registered(
        &mut self,
        urn: &Urn,
        req: &RegisterRequest,
        ephemeral: bool,
        deleted_with: &Option<Urn>,
        providers: &BTreeMap<String, String>,
    ) {
        self.registered.insert(
            urn.clone(),
            RegisteredInfo {
                custom: req.custom,
                ephemeral,
                deleted_with: deleted_with.clone(),
                providers: providers.clone(),
                qualified_type: urn.qualified_type().to_string(),
                parent: req.parent.clone(),
            },
        );
    }

    /// Builds the goal state for a registration. Dependencies on ephemeral
    /// resources are stripped from the persisted state; scheduling still
    /// honors them through the chain's dependency set.
    fn goal_state(
        &self,
        urn: &Urn,
        req: &RegisterRequest,
        checked_inputs: PropertyMap,
        provider: Option<&ProviderReference>,
        ephemeral: bool,
        deleted_with: Option<Urn>,
    ) -> ResourceState {
        let mut state = ResourceState::new(urn.clone(), &req.type_token, req.custom);
        state.inputs = checked_inputs;
        state.provider = provider.map(|p| p.to_string()).unwrap_or_default();
        state.parent = req.parent.clone();
        state.dependencies = req.dependencies.clone();
        state.property_dependencies = req.property_dependencies.clone();
        state.protect = req.protect;
        state.retain_on_delete = req.retain_on_delete;
        state.delete_before_replace = req.delete_before_replace;
        state.replace_on_changes = req.replace_on_changes.clone();
        state.deleted_with = deleted_with;
        state.aliases = req.alias_urns.clone();
        state.ephemeral = ephemeral;
        state.hooks = req.hooks.names();
        if let Some(trigger) = &req.replacement_trigger {
            state.replacement_trigger = Self::normalize_trigger(trigger);
        }
        if !ephemeral {
            state.strip_dependencies_on(&self.ephemerals);
        }
        state
    }

    /// The scheduling dependencies of a chain: everything the registration
    /// referenced, before ephemeral stripping.
    fn chain_depends(&self, req: &RegisterRequest, provider: &str) -> BTreeSet<Urn> {
        let mut depends: BTreeSet<Urn> = req.dependencies.iter().cloned().collect();
        for urns in req.property_dependencies.values() {
            depends.extend(urns.iter().cloned());
        }
        if let Some(parent) = &req.parent {
            depends.insert(parent.clone());
        }
        if let Some((urn, _)) = provider.rsplit_once("::") {
            if let Ok(urn) = Urn::parse(urn) {
                depends.insert(urn);
            }
        }
        depends
    }

    fn same_chain(
        &mut self,
        urn: &Urn,
        req: &RegisterRequest,
        old: Option<Arc<ResourceState>>,
        ephemeral: bool,
    ) -> StepChain {
        self.note_registered(urn, req, ephemeral, &None, &BTreeMap::new());
        let mut chain = match old {
            Some(old_state) => {
                let mut step = Step::new(StepOp::Same, urn.clone());
                step.new = Some(Arc::new((*old_state).clone()));
                step.old = Some(old_state);
                step.no_provider_call = true;
                StepChain::new(urn.clone(), vec![step])
            }
            None => StepChain::new(urn.clone(), Vec::new()),
        };
        chain.supports_result_reporting = req.supports_result_reporting;
        chain
    }

    /// Diff classification and replacement planning for one registration.
    async fn classify(
        &mut self,
        urn: &Urn,
        req: &RegisterRequest,
        old: Option<Arc<ResourceState>>,
        pending_replacement: Option<Arc<ResourceState>>,
        new_state: ResourceState,
    ) -> Result<StepChain, BailError> {
        let provider_ref = new_state.provider.clone();
        let new_shared = Arc::new(new_state);
        let depends = self.chain_depends(req, &provider_ref);

        let mk_chain = |steps: Vec<Step>| {
            let mut chain = StepChain::new(urn.clone(), steps);
            chain.depends = depends.clone();
            chain.supports_result_reporting = req.supports_result_reporting;
            chain
        };

        // A recovery create owed by an aborted delete-before-replace.
        if let Some(tombstone) = pending_replacement {
            let mut step = Step::new(StepOp::CreateReplacement, urn.clone());
            step.old = Some(tombstone);
            step.new = Some(new_shared);
            step.provider = provider_ref;
            step.hooks = req.hooks.clone();
            return Ok(mk_chain(vec![step]));
        }

        // The old state was deleted earlier this run as part of a
        // delete-before-replace chain rooted at a dependency.
        if old.is_none() {
            if let Some(deleted) = self.deleted_for_replacement.remove(urn) {
                let mut step = Step::new(StepOp::CreateReplacement, urn.clone());
                step.old = Some(deleted);
                step.new = Some(new_shared);
                step.provider = provider_ref;
                step.hooks = req.hooks.clone();
                return Ok(mk_chain(vec![step]));
            }
        }

        let Some(old_state) = old else {
            // Brand new resource: import when an import id was supplied,
            // create otherwise.
            let op = if req.custom && req.import_id.is_some() {
                StepOp::Import
            } else {
                StepOp::Create
            };
            let mut goal = (*new_shared).clone();
            if op == StepOp::Import {
                if let Some(import_id) = &req.import_id {
                    goal.id = import_id.clone();
                }
            }
            let mut step = Step::new(op, urn.clone());
            step.new = Some(Arc::new(goal));
            step.provider = provider_ref;
            // Plain components move state only; remote components go
            // through the provider's construct call.
            step.no_provider_call = !req.custom && !req.remote;
            step.hooks = req.hooks.clone();
            return Ok(mk_chain(vec![step]));
        };

        // Replacement trigger: any change forces the replace path; an
        // unknown trigger outside preview fails the operation.
        let mut trigger_changed = false;
        if let Some(trigger) = &req.replacement_trigger {
            match Self::normalize_trigger(trigger) {
                Some(normalized) => {
                    trigger_changed = old_state.replacement_trigger.as_ref() != Some(&normalized);
                }
                None if self.dry_run() => trigger_changed = true,
                None => {
                    self.events.diag(crate::diag::Diagnostic::error(
                        Some(urn.clone()),
                        "the replacement trigger is unknown; unknown values are not allowed outside of preview",
                    ));
                    return Err(BailError::UnknownReplacementTrigger { urn: urn.clone() });
                }
            }
        } else if old_state.replacement_trigger.is_some() {
            trigger_changed = true;
        }

        // Components have no provider diff: compare inputs structurally.
        if !req.custom {
            let same = old_state.inputs == new_shared.inputs && !trigger_changed;
            let op = if same { StepOp::Same } else { StepOp::Update };
            let mut step = Step::new(op, urn.clone());
            step.old = Some(old_state);
            step.new = Some(new_shared);
            step.no_provider_call = true;
            step.hooks = req.hooks.clone();
            return Ok(mk_chain(vec![step]));
        }

        let provider = self
            .registry
            .instance(&provider_ref)
            .ok_or_else(|| BailError::Config(format!("no provider instance for {}", urn)))?;

        let diff = provider
            .diff(
                urn,
                &old_state.id,
                &old_state.inputs,
                &old_state.outputs,
                &new_shared.inputs,
                &req.ignore_changes,
            )
            .await
            .map_err(|e| BailError::Config(format!("diff of {} failed: {}", urn, e)))?;

        let replace_on_changes_hit = req
            .replace_on_changes
            .iter()
            .any(|key| diff.changed_keys.contains(key));
        // Moving a resource to a different provider instance always
        // replaces it.
        let provider_changed = old_state.provider != new_shared.provider;
        let must_replace = diff.requires_replacement()
            || replace_on_changes_hit
            || trigger_changed
            || provider_changed;

        if !diff.has_changes() && !must_replace {
            let mut refreshed = (*new_shared).clone();
            refreshed.id = old_state.id.clone();
            refreshed.outputs = old_state.outputs.clone();
            refreshed.refresh_before_update = old_state.refresh_before_update;
            let mut step = Step::new(StepOp::Same, urn.clone());
            step.old = Some(old_state);
            step.new = Some(Arc::new(refreshed));
            step.no_provider_call = true;
            step.hooks = req.hooks.clone();
            return Ok(mk_chain(vec![step]));
        }

        if !must_replace {
            // Plain update, preceded by a read when the provider asked for
            // fresh state before updates.
            let mut steps = Vec::new();
            if old_state.refresh_before_update {
                let mut read = Step::new(StepOp::Read, urn.clone());
                read.old = Some(old_state.clone());
                read.provider = provider_ref.clone();
                steps.push(read);
            }
            let mut goal = (*new_shared).clone();
            goal.id = old_state.id.clone();
            let mut step = Step::new(StepOp::Update, urn.clone());
            step.old = Some(old_state);
            step.new = Some(Arc::new(goal));
            step.provider = provider_ref;
            step.keys = diff.changed_keys.clone();
            step.diff = Some(diff);
            step.hooks = req.hooks.clone();
            steps.push(step);
            return Ok(mk_chain(steps));
        }

        self.replacement_chain(
            urn,
            req,
            old_state,
            new_shared,
            provider_ref,
            diff,
            mk_chain,
        )
    }

    /// Builds the step sequence for a replacement, honoring
    /// delete-before-replace ordering and the protect directive.
    #[allow(clippy::too_many_arguments)]
    fn replacement_chain(
        &mut self,
        urn: &Urn,
        req: &RegisterRequest,
        old_state: Arc<ResourceState>,
        new_shared: Arc<ResourceState>,
        provider_ref: String,
        diff: DiffResult,
        mk_chain: impl FnOnce(Vec<Step>) -> StepChain,
    ) -> Result<StepChain, BailError> {
        if old_state.protect {
            return Err(BailError::ProtectedDelete { urn: urn.clone() });
        }

        let delete_before_replace = match req.delete_before_replace {
            Some(explicit) => explicit,
            None => diff.delete_before_replace || old_state.delete_before_replace.unwrap_or(false),
        };

        let mut steps = Vec::new();
        if delete_before_replace {
            // Delete old dependents first, in reverse dependency order;
            // their replacement creates happen when their registrations
            // arrive.
            let dependents = self.dependents_of(urn);
            for dependent in &dependents {
                if dependent.protect {
                    return Err(BailError::ProtectedReplacement {
                        dependent: dependent.urn.clone(),
                        root: urn.clone(),
                    });
                }
            }
            for dependent in dependents {
                let dependent_urn = dependent.urn.clone();
                self.olds.remove(&dependent_urn);
                let mut step = Step::new(StepOp::DeleteReplaced, dependent_urn.clone());
                step.provider = dependent.provider.clone();
                step.old = Some(dependent.clone());
                step.pending_replace = true;
                step.hooks = self
                    .resource_hooks
                    .get(&dependent_urn)
                    .cloned()
                    .unwrap_or_default();
                steps.push(step);
                self.deleted_for_replacement
                    .insert(dependent_urn, dependent);
            }

            let mut delete = Step::new(StepOp::DeleteReplaced, urn.clone());
            delete.old = Some(old_state.clone());
            delete.provider = old_state.provider.clone();
            delete.pending_replace = true;
            delete.hooks = req.hooks.clone();
            steps.push(delete);
        } else {
            // Create-before-delete: the old resource's delete is deferred
            // to the end of the operation.
            let mut delete = Step::new(StepOp::DeleteReplaced, old_state.urn.clone());
            delete.old = Some(old_state.clone());
            delete.provider = old_state.provider.clone();
            delete.hooks = req.hooks.clone();
            self.deferred_deletes.push(delete);
        }

        let mut create = Step::new(StepOp::CreateReplacement, urn.clone());
        create.old = Some(old_state);
        create.new = Some(new_shared);
        create.provider = provider_ref;
        create.keys = diff.replace_keys.clone();
        create.diff = Some(diff);
        create.hooks = req.hooks.clone();
        steps.push(create);

        Ok(mk_chain(steps))
    }

    /// The transitive dependents of a URN among unclaimed old states, in
    /// reverse topological (deletion) order.
    fn dependents_of(&self, root: &Urn) -> Vec<Arc<ResourceState>> {
        let mut affected: HashSet<Urn> = HashSet::new();
        affected.insert(root.clone());

        let mut result = Vec::new();
        // Base order is topological, so one forward pass finds the closure;
        // reversing it yields deletion order.
        for state in &self.base {
            if state.delete || !self.olds.contains_key(&state.urn) {
                continue;
            }
            if state
                .all_dependencies()
                .iter()
                .any(|dep| affected.contains(dep))
            {
                affected.insert(state.urn.clone());
                result.push(state.clone());
            }
        }
        result.reverse();
        result
    }

    /// Processes a `read-resource` event into a chain.
    pub async fn read(&mut self, req: ReadRequest) -> Result<GeneratedChains, BailError> {
        let register_req = RegisterRequest {
            type_token: req.type_token.clone(),
            name: req.name.clone(),
            custom: true,
            parent: req.parent.clone(),
            provider: req.provider.clone(),
            inputs: req.inputs.clone(),
            ..Default::default()
        };
        let urn = self.make_urn(&register_req);

        let mut chains = Vec::new();
        let reference = self
            .resolve_provider(&register_req, &BTreeMap::new(), &mut chains)
            .await?;

        let mut state = ResourceState::new(urn.clone(), &req.type_token, true);
        state.id = req.id.clone();
        state.inputs = req.inputs.clone();
        state.provider = reference.to_string();
        state.external = true;
        state.parent = req.parent.clone();

        let old = self.olds.remove(&urn);
        self.note_registered(&urn, &register_req, false, &None, &BTreeMap::new());

        let mut step = Step::new(StepOp::Read, urn.clone());
        step.old = old;
        step.new = Some(Arc::new(state));
        step.provider = reference.to_string();
        let mut chain = StepChain::new(urn, vec![step]);
        chain.depends = self.chain_depends(&register_req, &reference.to_string());
        chains.push(chain);
        Ok(GeneratedChains { chains })
    }

    /// The hook bindings registered for a URN this run.
    pub fn hooks_for(&self, urn: &Urn) -> HookBindings {
        self.resource_hooks.get(urn).cloned().unwrap_or_default()
    }

    /// Attaches hook bindings discovered outside a registration (destroy
    /// with `--run-program`).
    pub fn attach_hooks(&mut self, urn: Urn, hooks: HookBindings) {
        self.resource_hooks.insert(urn, hooks);
    }

    /// Emits the deletions owed at the end of the program: prior resources
    /// absent from the program, pending deletes from earlier operations,
    /// ephemeral resources created this run, and deferred replaced deletes.
    pub fn finalize(&mut self) -> Result<Vec<StepChain>, BailError> {
        let mut deletes: Vec<Step> = Vec::new();

        // Prior live resources not seen this run, in reverse snapshot
        // order. External reads are discarded without a provider call.
        // Targeted operations leave non-targeted resources alone.
        let mut unregistered: Vec<Arc<ResourceState>> = Vec::new();
        for state in self.base.iter().rev() {
            if state.delete {
                continue;
            }
            if let Some(targets) = &self.targets {
                if !targets.matches(&state.urn) {
                    continue;
                }
            }
            if self.olds.remove(&state.urn).is_some() {
                unregistered.push(state.clone());
            }
        }

        let deleting: HashSet<Urn> = unregistered.iter().map(|s| s.urn.clone()).collect();

        for state in unregistered {
            if state.protect {
                return Err(BailError::ProtectedDelete {
                    urn: state.urn.clone(),
                });
            }
            let mut step = Step::new(StepOp::Delete, state.urn.clone());
            step.provider = state.provider.clone();
            step.hooks = self.hooks_for(&state.urn);
            if state.retain_on_delete || state.external || !state.custom {
                step.no_provider_call = true;
            }
            if let Some(target) = &state.deleted_with {
                if deleting.contains(target) || !self.registered.contains_key(target) {
                    step.no_provider_call = true;
                }
            }
            step.old = Some(state);
            deletes.push(step);
        }

        // Pending deletes from prior operations.
        for tombstone in std::mem::take(&mut self.pending_deletes) {
            let mut step = Step::new(StepOp::Delete, tombstone.urn.clone());
            step.provider = tombstone.provider.clone();
            step.old = Some(tombstone);
            deletes.push(step);
        }

        // Ephemeral resources die with the operation, newest first. Their
        // committed states live with the executor, so order them by an
        // explicit edge to the previously deleted ephemeral.
        let mut ephemeral_edges: Vec<(Urn, Urn)> = Vec::new();
        let ephemeral_order = std::mem::take(&mut self.ephemeral_order);
        let mut previous: Option<Urn> = None;
        for urn in ephemeral_order.into_iter().rev() {
            let mut step = Step::new(StepOp::Delete, urn.clone());
            step.hooks = self.hooks_for(&urn);
            // The executor resolves the committed state for the delete.
            deletes.push(step);
            if let Some(prev) = previous.replace(urn.clone()) {
                ephemeral_edges.push((urn, prev));
            }
        }

        // Deferred deletes of replaced resources run last.
        deletes.extend(std::mem::take(&mut self.deferred_deletes));

        // Invert edges: a delete waits for the deletes of its dependents.
        let in_phase: HashSet<Urn> = deletes.iter().map(|s| s.urn.clone()).collect();
        let mut dependents: HashMap<Urn, BTreeSet<Urn>> = HashMap::new();
        for step in &deletes {
            if let Some(old) = &step.old {
                for dep in old.all_dependencies() {
                    if in_phase.contains(&dep) {
                        dependents
                            .entry(dep)
                            .or_default()
                            .insert(old.urn.clone());
                    }
                }
            }
        }
        for (waiting, prerequisite) in ephemeral_edges {
            dependents.entry(waiting).or_default().insert(prerequisite);
        }

        let chains = deletes
            .into_iter()
            .map(|step| {
                let urn = step.urn.clone();
                let mut chain = StepChain::new(urn.clone(), vec![step]);
                chain.depends = dependents.remove(&urn).unwrap_or_default();
                chain
            })
            .collect();
        Ok(chains)
    }
}
