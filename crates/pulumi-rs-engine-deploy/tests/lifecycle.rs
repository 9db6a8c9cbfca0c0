//! End-to-end lifecycle tests: program → source iterator → step generator →
//! step executor → journal → snapshot, against the scriptable test
//! provider.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use pulumi_rs_engine_deploy::deployment::{Deployment, ImportResource};
use pulumi_rs_engine_deploy::error::{BailError, DeployError};
use pulumi_rs_engine_deploy::events::{CollectingSink, EngineEvent};
use pulumi_rs_engine_deploy::hooks::HookStage;
use pulumi_rs_engine_deploy::options::UpdateOptions;
use pulumi_rs_engine_deploy::diag::Severity;
use pulumi_rs_engine_deploy::provider::{ProviderError, ReadResult};
use pulumi_rs_engine_deploy::source::{RegisterRequest, SourceError};
use pulumi_rs_engine_deploy::testing::{
    custom_resource, hook, program_fn, program_of, ScriptedHook, TestProviderConfig,
    TestProviderHost,
};
use pulumi_rs_engine_resource::{PropertyMap, PropertyValue, Snapshot, Urn};

fn urn(name: &str) -> Urn {
    Urn::new("test", "test", None, "pkgA:index:typ", name)
}

fn provider_urn(name: &str) -> Urn {
    Urn::new("test", "test", None, "pulumi:providers:pkgA", name)
}

fn deployment(host: &Arc<TestProviderHost>) -> Deployment {
    Deployment::new("test", "test", host.clone())
}

fn live_urns(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .resources
        .iter()
        .filter(|r| !r.delete)
        .map(|r| r.urn.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn test_single_resource_update() {
    let host = Arc::new(TestProviderHost::new());
    let result = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    // The default provider is injected ahead of the resource.
    assert_eq!(result.snapshot.resources.len(), 2);
    assert!(result.snapshot.resources[0].urn.is_provider());
    let res = result.snapshot.resource(&urn("resA")).unwrap();
    assert!(!res.id.is_empty());
    assert_eq!(res.inputs.get("A"), Some(&PropertyValue::string("foo")));
    assert_eq!(host.recorded().creates().len(), 1);
    result.snapshot.verify_integrity().unwrap();
}

#[tokio::test]
async fn test_idempotent_rerun_yields_same_steps() {
    let host = Arc::new(TestProviderHost::new());
    let program =
        || program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]);

    let first = deployment(&host)
        .update(&Snapshot::empty(), program())
        .await
        .unwrap();
    let second = deployment(&host)
        .update(&first.snapshot, program())
        .await
        .unwrap();

    // No create, update, or delete on the second run.
    assert_eq!(host.recorded().creates().len(), 1);
    assert!(host.recorded().updates().is_empty());
    assert!(host.recorded().deletes().is_empty());
    assert_eq!(first.snapshot.resources, second.snapshot.resources);
}

#[tokio::test]
async fn test_update_on_changed_inputs() {
    let host = Arc::new(TestProviderHost::new());
    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();
    let second = deployment(&host)
        .update(
            &first.snapshot,
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "bar")])]),
        )
        .await
        .unwrap();

    let updates = host.recorded().updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].old_inputs.get("A"),
        Some(&PropertyValue::string("foo"))
    );
    assert_eq!(
        updates[0].new_inputs.get("A"),
        Some(&PropertyValue::string("bar"))
    );
    let res = second.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(res.inputs.get("A"), Some(&PropertyValue::string("bar")));
}

#[tokio::test]
async fn test_absent_resource_is_deleted_in_reverse_order() {
    let host = Arc::new(TestProviderHost::new());
    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![
                custom_resource("pkgA:index:typ", "resA", &[]),
                {
                    let mut req = custom_resource("pkgA:index:typ", "resB", &[]);
                    req.dependencies = vec![urn("resA")];
                    req
                },
            ]),
        )
        .await
        .unwrap();

    let second = deployment(&host)
        .update(&first.snapshot, program_of(Vec::new()))
        .await
        .unwrap();

    let deletes = host.recorded().deletes();
    assert_eq!(deletes.len(), 2);
    // The dependent goes first.
    assert_eq!(deletes[0].urn, urn("resB"));
    assert_eq!(deletes[1].urn, urn("resA"));
    assert!(second.snapshot.resources.is_empty());
}

// Scenario: a single ephemeral resource is created and deleted within one
// operation and never reaches the snapshot.
#[tokio::test]
async fn test_single_ephemeral_resource() {
    let host = Arc::new(TestProviderHost::new());
    let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
    req.ephemeral = true;

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    assert_eq!(host.recorded().creates().len(), 1);
    assert_eq!(host.recorded().deletes().len(), 1);
    assert_eq!(host.recorded().deletes()[0].urn, urn("resA"));
    // Only the default provider survives.
    assert_eq!(result.snapshot.resources.len(), 1);
    assert!(result.snapshot.resources[0].urn.is_provider());
}

// Scenario: dependencies on ephemeral resources are erased from persisted
// dependents.
#[tokio::test]
async fn test_ephemeral_dependency_erasure() {
    let host = Arc::new(TestProviderHost::new());
    let mut eph = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
    eph.ephemeral = true;
    let mut dependent = custom_resource("pkgA:index:typ", "resB", &[("A", "bar")]);
    dependent.dependencies = vec![urn("resA")];
    dependent
        .property_dependencies
        .insert("A".to_string(), vec![urn("resA")]);

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![eph, dependent]))
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    assert_eq!(result.snapshot.resources.len(), 2, "{:?}", live_urns(&result.snapshot));
    let res_b = result.snapshot.resource(&urn("resB")).unwrap();
    assert!(res_b.dependencies.is_empty());
    assert!(res_b.property_dependencies.is_empty());
    result.snapshot.verify_integrity().unwrap();
}

fn dbr_programs(a_value: &str, protect_b: bool) -> Vec<RegisterRequest> {
    let mut res_a = custom_resource("pkgA:index:typ", "resA", &[("A", a_value)]);
    res_a.delete_before_replace = Some(true);
    let mut res_b = custom_resource("pkgA:index:typ", "resB", &[("B", "b")]);
    res_b.dependencies = vec![urn("resA")];
    res_b.protect = protect_b;
    vec![res_a, res_b]
}

// Scenario: a protected dependent aborts a delete-before-replace chain with
// a structured error naming both URNs.
#[tokio::test]
async fn test_delete_before_replace_protect_violation() {
    let host = Arc::new(TestProviderHost::new());
    host.set_config(
        "pkgA",
        TestProviderConfig {
            replace_keys: vec!["A".to_string()],
            ..Default::default()
        },
    );

    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(dbr_programs("foo", true)))
        .await
        .unwrap();
    assert!(first.is_ok(), "diags: {}", first.diagnostics);

    // Changing A forces a replacement of resA; protected resB blocks it.
    let err = deployment(&host)
        .update(&first.snapshot, program_of(dbr_programs("bar", true)))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains(&format!(
            "unable to replace resource \"{}\" as part of replacing \"{}\" as it is currently marked for protection",
            urn("resB"),
            urn("resA"),
        )),
        "unexpected message: {}",
        message
    );
    assert!(host.recorded().deletes().is_empty());

    // Clear the protection (a metadata-only run), then replace.
    let second = deployment(&host)
        .update(&first.snapshot, program_of(dbr_programs("foo", false)))
        .await
        .unwrap();
    assert!(second.is_ok(), "diags: {}", second.diagnostics);

    let third = deployment(&host)
        .update(&second.snapshot, program_of(dbr_programs("bar", false)))
        .await
        .unwrap();
    assert!(third.is_ok(), "diags: {}", third.diagnostics);
    assert_eq!(third.snapshot.resources.len(), 3);
    third.snapshot.verify_integrity().unwrap();

    // Delete-before-replace ordering: both deletes precede the creates.
    let deletes = host.recorded().deletes();
    assert_eq!(deletes.len(), 2);
    assert_eq!(deletes[0].urn, urn("resB"));
    assert_eq!(deletes[1].urn, urn("resA"));
}

// Protected resources never see a delete step.
#[tokio::test]
async fn test_protected_resource_is_never_deleted() {
    let host = Arc::new(TestProviderHost::new());
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.protect = true;
    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    let err = deployment(&host)
        .update(&first.snapshot, program_of(Vec::new()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("marked for protection"));
    assert!(host.recorded().deletes().is_empty());
}

// Scenario: an OnError hook retries a partial failure and the second
// attempt succeeds.
#[tokio::test]
async fn test_on_error_retry_then_success() {
    let host = Arc::new(TestProviderHost::new());
    host.queue_create(Err(ProviderError::PartialFailure {
        message: "interrupted".to_string(),
        id: None,
        outputs: PropertyMap::new(),
    }));

    let retry_hook = ScriptedHook::retrying();
    let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
    req.hooks.push(hook("recover", HookStage::OnError, retry_hook.clone()));

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    assert_eq!(host.recorded().creates().len(), 2);
    assert_eq!(retry_hook.calls().len(), 1);
    let args = &retry_hook.calls()[0];
    assert_eq!(args.errors.len(), 1);
    assert!(args.errors[0].contains("interrupted"));
    assert!(result.snapshot.resource(&urn("resA")).is_some());
}

// Scenario: the retry loop is bounded at 100 retries and emits a warning
// with the canonical substring.
#[tokio::test]
async fn test_on_error_retry_limit() {
    let host = Arc::new(TestProviderHost::new());
    host.set_config(
        "pkgA",
        TestProviderConfig {
            always_partial_create: true,
            ..Default::default()
        },
    );

    let retry_hook = ScriptedHook::retrying();
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.hooks.push(hook("recover", HookStage::OnError, retry_hook.clone()));

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    assert!(result.error.is_some());
    // The first attempt plus exactly 100 retries.
    assert_eq!(host.recorded().creates().len(), 101);
    let warned = result.diagnostics.iter().any(|d| {
        d.severity == Severity::Warning
            && d.message.contains("maximum number of error hook retries")
    });
    assert!(warned, "diags: {}", result.diagnostics);
}

// OnError hooks fire only when the provider failed.
#[tokio::test]
async fn test_on_error_not_invoked_on_success() {
    let host = Arc::new(TestProviderHost::new());
    let error_hook = ScriptedHook::retrying();
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.hooks.push(hook("recover", HookStage::OnError, error_hook.clone()));

    deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();
    assert!(error_hook.calls().is_empty());
}

// An AfterCreate hook observes the checked inputs and post-create outputs,
// and no old values.
#[tokio::test]
async fn test_after_create_hook_payload() {
    let host = Arc::new(TestProviderHost::new());
    let after = ScriptedHook::succeeding();
    let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
    req.hooks.push(hook("observe", HookStage::AfterCreate, after.clone()));

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();
    assert!(result.is_ok(), "diags: {}", result.diagnostics);

    let calls = after.calls();
    assert_eq!(calls.len(), 1);
    let args = &calls[0];
    assert_eq!(
        args.new_inputs.as_ref().and_then(|m| m.get("A")),
        Some(&PropertyValue::string("foo"))
    );
    let committed = result.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(args.new_outputs.as_ref(), Some(&committed.outputs));
    assert_eq!(args.id, committed.id);
    assert!(args.old_inputs.is_none());
    assert!(args.old_outputs.is_none());
}

// A before-hook failure prevents the provider call.
#[tokio::test]
async fn test_before_hook_failure_blocks_provider() {
    let host = Arc::new(TestProviderHost::new());
    let before = ScriptedHook::failing("not allowed");
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.hooks.push(hook("gate", HookStage::BeforeCreate, before));

    let result = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    assert!(result.error.is_some());
    assert!(host.recorded().creates().is_empty());
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.message.contains("hook \"gate\" failed: not allowed")));
}

// Scenario: refresh-before-update reads fresh state ahead of the update.
#[tokio::test]
async fn test_refresh_before_update() {
    let host = Arc::new(TestProviderHost::new());
    host.set_config(
        "pkgA",
        TestProviderConfig {
            supports_refresh_before_update: true,
            ..Default::default()
        },
    );

    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();
    let stored = first.snapshot.resource(&urn("resA")).unwrap();
    assert!(stored.refresh_before_update);

    // The provider reports drifted state; the update must see it.
    let mut drifted = PropertyMap::new();
    drifted.insert("A".to_string(), PropertyValue::string("drifted"));
    host.queue_read(Some(ReadResult {
        id: stored.id.clone(),
        inputs: drifted.clone(),
        outputs: drifted.clone(),
    }));

    deployment(&host)
        .update(
            &first.snapshot,
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "bar")])]),
        )
        .await
        .unwrap();

    assert_eq!(host.recorded().reads().len(), 1);
    let updates = host.recorded().updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].old_inputs.get("A"),
        Some(&PropertyValue::string("drifted"))
    );
    assert_eq!(
        updates[0].old_outputs.get("A"),
        Some(&PropertyValue::string("drifted"))
    );
}

// Scenario: replacing an explicit provider via an alias; the new instance
// creates the replacement while the old instance deletes the old resource.
#[tokio::test]
async fn test_explicit_provider_alias_replacement() {
    let host = Arc::new(TestProviderHost::new());

    let run =
        |provider_name: &'static str, region: &'static str, aliases: Vec<Urn>| {
            program_fn(move |ctx| async move {
                let mut prov = RegisterRequest {
                    type_token: "pulumi:providers:pkgA".to_string(),
                    name: provider_name.to_string(),
                    custom: true,
                    alias_urns: aliases,
                    ..Default::default()
                };
                prov.inputs
                    .insert("region".to_string(), PropertyValue::string(region));
                let prov_resp = ctx.register_resource(prov).await?;
                let reference = format!("{}::{}", prov_resp.urn, prov_resp.id);

                let mut res = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
                res.provider = Some(reference);
                ctx.register_resource(res).await?;
                Ok(())
            })
        };

    let first = deployment(&host)
        .update(&Snapshot::empty(), run("provA", "east", Vec::new()))
        .await
        .unwrap();
    assert!(first.is_ok(), "diags: {}", first.diagnostics);
    assert!(first.snapshot.resource(&provider_urn("provA")).is_some());

    let second = deployment(&host)
        .update(
            &first.snapshot,
            run("provB", "west", vec![provider_urn("provA")]),
        )
        .await
        .unwrap();
    assert!(second.is_ok(), "diags: {}", second.diagnostics);
    assert!(second.snapshot.resource(&provider_urn("provA")).is_none());
    assert!(second.snapshot.resource(&provider_urn("provB")).is_some());

    // Map instances to the region they were configured with.
    let recorded = host.recorded();
    let configured_region = |instance: usize| -> Option<String> {
        recorded
            .configure_calls_with_instance()
            .into_iter()
            .filter(|(i, _)| *i == instance)
            .filter_map(|(_, inputs)| {
                inputs.get("region").and_then(|v| v.as_str()).map(String::from)
            })
            .next()
    };

    let creates = recorded.creates();
    assert_eq!(creates.len(), 2);
    let replacement_create = &creates[1];
    assert_eq!(
        configured_region(replacement_create.instance).as_deref(),
        Some("west")
    );

    let deletes = recorded.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].urn, urn("resA"));
    assert_eq!(configured_region(deletes[0].instance).as_deref(), Some("east"));
}

// Continue-on-error: dependents of a failed resource are skipped while
// independent subtrees complete.
#[tokio::test]
async fn test_continue_on_error_skips_dependents() {
    let host = Arc::new(TestProviderHost::new());
    host.queue_create(Err(ProviderError::Failure {
        message: "boom".to_string(),
    }));

    let program = program_fn(|ctx| async move {
        let failed = ctx
            .register_resource(custom_resource("pkgA:index:typ", "resA", &[]))
            .await;
        assert!(failed.is_err());

        let mut dependent = custom_resource("pkgA:index:typ", "resB", &[]);
        dependent.dependencies = vec![urn("resA")];
        let skipped = ctx.register_resource(dependent).await;
        assert!(matches!(skipped, Err(SourceError::Registration(_))));

        ctx.register_resource(custom_resource("pkgA:index:typ", "resC", &[]))
            .await?;
        Ok(())
    });

    let opts = UpdateOptions {
        continue_on_error: true,
        ..Default::default()
    };
    let result = deployment(&host)
        .with_options(opts)
        .update(&Snapshot::empty(), program)
        .await
        .unwrap();

    assert!(result.error.is_some());
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.skipped, 1);
    assert!(result.snapshot.resource(&urn("resC")).is_some());
    assert!(result.snapshot.resource(&urn("resA")).is_none());
    assert!(result.snapshot.resource(&urn("resB")).is_none());
}

// A partial-failure create with an assigned id persists that id.
#[tokio::test]
async fn test_partial_failure_persists_id() {
    let host = Arc::new(TestProviderHost::new());
    host.queue_create(Err(ProviderError::PartialFailure {
        message: "timed out".to_string(),
        id: Some("id-orphan".to_string()),
        outputs: PropertyMap::new(),
    }));

    let program = program_fn(|ctx| async move {
        let _ = ctx
            .register_resource(custom_resource("pkgA:index:typ", "resA", &[]))
            .await;
        Ok(())
    });
    let opts = UpdateOptions {
        continue_on_error: true,
        ..Default::default()
    };
    let result = deployment(&host)
        .with_options(opts)
        .update(&Snapshot::empty(), program)
        .await
        .unwrap();

    assert!(result.error.is_some());
    let orphan = result.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(orphan.id, "id-orphan");
}

// Default providers are denied per package (or `*`), cancelling the
// registration.
#[tokio::test]
async fn test_disable_default_providers() {
    let host = Arc::new(TestProviderHost::new());
    let opts = UpdateOptions {
        disable_default_providers: vec!["pkgA".to_string()],
        ..Default::default()
    };
    let err = deployment(&host)
        .with_options(opts)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[])]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::Bail(BailError::DefaultProviderDenied { .. })
    ));
    assert!(err.to_string().contains("pkgA"));
}

// A malformed provider reference is rejected at resolution time.
#[tokio::test]
async fn test_malformed_provider_reference() {
    let host = Arc::new(TestProviderHost::new());
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.provider = Some("not-a-reference".to_string());
    let err = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("could not parse provider reference"));
}

// Duplicate registrations of one URN bail.
#[tokio::test]
async fn test_duplicate_registration() {
    let host = Arc::new(TestProviderHost::new());
    let program = program_fn(|ctx| async move {
        ctx.register_resource(custom_resource("pkgA:index:typ", "resA", &[]))
            .await?;
        let _ = ctx
            .register_resource(custom_resource("pkgA:index:typ", "resA", &[]))
            .await;
        Ok(())
    });
    let err = deployment(&host)
        .update(&Snapshot::empty(), program)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::Bail(BailError::DuplicateRegistration { .. })
    ));
}

// retain-on-delete removes state without touching the provider.
#[tokio::test]
async fn test_retain_on_delete() {
    let host = Arc::new(TestProviderHost::new());
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.retain_on_delete = true;
    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    let second = deployment(&host)
        .update(&first.snapshot, program_of(Vec::new()))
        .await
        .unwrap();
    assert!(host.recorded().deletes().is_empty());
    assert!(second.snapshot.resource(&urn("resA")).is_none());
}

// deleted-with drops the dependent without a provider call when its anchor
// is deleted.
#[tokio::test]
async fn test_deleted_with() {
    let host = Arc::new(TestProviderHost::new());
    let anchor = custom_resource("pkgA:index:typ", "resA", &[]);
    let mut follower = custom_resource("pkgA:index:typ", "resB", &[]);
    follower.deleted_with = Some(urn("resA"));
    follower.dependencies = vec![urn("resA")];

    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![anchor, follower]))
        .await
        .unwrap();
    assert!(first.is_ok(), "diags: {}", first.diagnostics);

    let second = deployment(&host)
        .update(&first.snapshot, program_of(Vec::new()))
        .await
        .unwrap();
    let deletes = host.recorded().deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].urn, urn("resA"));
    assert!(second.snapshot.resources.is_empty());
}

// Preview calls providers in preview mode and commits nothing.
#[tokio::test]
async fn test_preview_commits_nothing() {
    let host = Arc::new(TestProviderHost::new());
    let result = deployment(&host)
        .preview(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    let creates = host.recorded().creates();
    assert_eq!(creates.len(), 1);
    assert!(creates[0].preview);
    // Unknowns propagate through preview outputs.
    let previewed = result.snapshot.resource(&urn("resA")).unwrap();
    assert!(previewed.id.is_empty());
    assert!(previewed
        .outputs
        .values()
        .any(|v| v.contains_unknowns()));
}

// Import adopts an existing resource by id.
#[tokio::test]
async fn test_import_adopts_existing_resource() {
    let host = Arc::new(TestProviderHost::new());
    let result = deployment(&host)
        .import(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
            vec![ImportResource {
                type_token: "pkgA:index:typ".to_string(),
                name: "resA".to_string(),
                id: "import-1".to_string(),
            }],
        )
        .await
        .unwrap();

    assert!(result.is_ok(), "diags: {}", result.diagnostics);
    assert!(host.recorded().creates().is_empty());
    assert_eq!(host.recorded().reads().len(), 1);
    let imported = result.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(imported.id, "import-1");
}

// Refresh projects provider reads as Same, Update, or Delete.
#[tokio::test]
async fn test_refresh_updates_and_deletes() {
    let host = Arc::new(TestProviderHost::new());
    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![
                custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]),
                custom_resource("pkgA:index:typ", "resB", &[("B", "b")]),
            ]),
        )
        .await
        .unwrap();

    // resA drifted; resB is gone.
    let mut drifted = PropertyMap::new();
    drifted.insert("A".to_string(), PropertyValue::string("changed"));
    let stored_a = first.snapshot.resource(&urn("resA")).unwrap();
    host.queue_read(Some(ReadResult {
        id: stored_a.id.clone(),
        inputs: drifted.clone(),
        outputs: drifted,
    }));
    host.queue_read(None);

    let refreshed = deployment(&host).refresh(&first.snapshot).await.unwrap();
    assert!(refreshed.is_ok(), "diags: {}", refreshed.diagnostics);

    let res_a = refreshed.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(res_a.inputs.get("A"), Some(&PropertyValue::string("changed")));
    assert!(refreshed.snapshot.resource(&urn("resB")).is_none());
    refreshed.snapshot.verify_integrity().unwrap();
}

// With the legacy flag, refresh only considers outputs.
#[tokio::test]
async fn test_refresh_legacy_diff_keeps_inputs() {
    let host = Arc::new(TestProviderHost::new());
    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();

    let mut drifted = PropertyMap::new();
    drifted.insert("A".to_string(), PropertyValue::string("changed"));
    let stored = first.snapshot.resource(&urn("resA")).unwrap();
    host.queue_read(Some(ReadResult {
        id: stored.id.clone(),
        inputs: drifted.clone(),
        outputs: drifted,
    }));

    let opts = UpdateOptions {
        use_legacy_refresh_diff: true,
        ..Default::default()
    };
    let refreshed = deployment(&host)
        .with_options(opts)
        .refresh(&first.snapshot)
        .await
        .unwrap();

    let res_a = refreshed.snapshot.resource(&urn("resA")).unwrap();
    assert_eq!(res_a.inputs.get("A"), Some(&PropertyValue::string("foo")));
    assert_eq!(res_a.outputs.get("A"), Some(&PropertyValue::string("changed")));
}

// Destroy without --run-program fails when delete hooks are bound.
#[tokio::test]
async fn test_destroy_requires_program_for_delete_hooks() {
    let host = Arc::new(TestProviderHost::new());
    let before = ScriptedHook::succeeding();
    let mut req = custom_resource("pkgA:index:typ", "resA", &[]);
    req.hooks.push(hook("cleanup", HookStage::BeforeDelete, before));

    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();

    let err = deployment(&host)
        .destroy(&first.snapshot, None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "You must run with the `--run-program` flag to use delete hooks during destroy."
    );
}

// Destroy with --run-program discovers hook bindings from the program and
// fires them around the deletes.
#[tokio::test]
async fn test_destroy_with_program_runs_delete_hooks() {
    let host = Arc::new(TestProviderHost::new());
    let before = ScriptedHook::succeeding();

    let req_with_hook = |handler: Arc<ScriptedHook>| {
        let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
        req.hooks.push(hook("cleanup", HookStage::BeforeDelete, handler));
        req
    };

    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![req_with_hook(before.clone())]),
        )
        .await
        .unwrap();

    let opts = UpdateOptions {
        run_program: true,
        ..Default::default()
    };
    let destroyed = deployment(&host)
        .with_options(opts)
        .destroy(
            &first.snapshot,
            Some(program_of(vec![req_with_hook(before.clone())])),
        )
        .await
        .unwrap();

    assert!(destroyed.is_ok(), "diags: {}", destroyed.diagnostics);
    assert!(destroyed.snapshot.resources.is_empty());
    let calls = before.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].old_inputs.is_some());
    assert!(calls[0].new_inputs.is_none());
}

// Targeted updates leave everything else untouched.
#[tokio::test]
async fn test_targets_limit_operations() {
    let host = Arc::new(TestProviderHost::new());
    let programs = |a: &'static str, b: &'static str| {
        program_of(vec![
            custom_resource("pkgA:index:typ", "resA", &[("A", a)]),
            custom_resource("pkgA:index:typ", "resB", &[("B", b)]),
        ])
    };

    let first = deployment(&host)
        .update(&Snapshot::empty(), programs("foo", "bar"))
        .await
        .unwrap();

    let opts = UpdateOptions {
        targets: Some(vec![urn("resA").as_str().to_string()]),
        ..Default::default()
    };
    let second = deployment(&host)
        .with_options(opts)
        .update(&first.snapshot, programs("foo2", "bar2"))
        .await
        .unwrap();

    let updates = host.recorded().updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].urn, urn("resA"));
    let res_b = second.snapshot.resource(&urn("resB")).unwrap();
    assert_eq!(res_b.inputs.get("B"), Some(&PropertyValue::string("bar")));
}

// Component outputs registered after the fact land in the snapshot, and
// providers are inherited through component parents only.
#[tokio::test]
async fn test_component_outputs_and_parenting() {
    let host = Arc::new(TestProviderHost::new());
    let program = program_fn(|ctx| async move {
        let comp = RegisterRequest {
            type_token: "my:component:Comp".to_string(),
            name: "comp".to_string(),
            custom: false,
            ..Default::default()
        };
        let comp_resp = ctx.register_resource(comp).await?;

        let mut child = custom_resource("pkgA:index:typ", "child", &[]);
        child.parent = Some(comp_resp.urn.clone());
        ctx.register_resource(child).await?;

        let mut outputs = PropertyMap::new();
        outputs.insert("count".to_string(), PropertyValue::Number(1.0));
        ctx.register_resource_outputs(comp_resp.urn, outputs).await?;
        Ok(())
    });

    let result = deployment(&host)
        .update(&Snapshot::empty(), program)
        .await
        .unwrap();
    assert!(result.is_ok(), "diags: {}", result.diagnostics);

    let comp_urn = Urn::new("test", "test", None, "my:component:Comp", "comp");
    let comp = result.snapshot.resource(&comp_urn).unwrap();
    assert_eq!(comp.outputs.get("count"), Some(&PropertyValue::Number(1.0)));

    // The child's URN carries the parent type chain.
    let child_urn = Urn::parse(
        "urn:pulumi:test::test::my:component:Comp$pkgA:index:typ::child",
    )
    .unwrap();
    let child = result.snapshot.resource(&child_urn).unwrap();
    assert_eq!(child.parent.as_ref(), Some(&comp_urn));
    result.snapshot.verify_integrity().unwrap();
}

// Replacement triggers force the replace path regardless of the diff.
#[tokio::test]
async fn test_replacement_trigger_forces_replace() {
    let host = Arc::new(TestProviderHost::new());
    let with_trigger = |value: &'static str| {
        let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "same")]);
        req.replacement_trigger = Some(PropertyValue::secret(PropertyValue::string(value)));
        req
    };

    let first = deployment(&host)
        .update(&Snapshot::empty(), program_of(vec![with_trigger("one")]))
        .await
        .unwrap();
    assert!(first.is_ok(), "diags: {}", first.diagnostics);

    // Same trigger, no input changes: nothing happens.
    deployment(&host)
        .update(&first.snapshot, program_of(vec![with_trigger("one")]))
        .await
        .unwrap();
    assert_eq!(host.recorded().creates().len(), 1);

    // Changed trigger: replacement even though inputs are identical.
    let third = deployment(&host)
        .update(&first.snapshot, program_of(vec![with_trigger("two")]))
        .await
        .unwrap();
    assert!(third.is_ok(), "diags: {}", third.diagnostics);
    assert_eq!(host.recorded().creates().len(), 2);
    assert_eq!(host.recorded().deletes().len(), 1);
}

// An update with the refresh option reconciles state first: a resource the
// provider reports gone is recreated.
#[tokio::test]
async fn test_update_with_refresh_recreates_missing_resource() {
    let host = Arc::new(TestProviderHost::new());
    let first = deployment(&host)
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();

    // The resource vanished out of band.
    host.queue_read(None);

    let opts = UpdateOptions {
        refresh: true,
        ..Default::default()
    };
    let second = deployment(&host)
        .with_options(opts)
        .update(
            &first.snapshot,
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[("A", "foo")])]),
        )
        .await
        .unwrap();

    assert!(second.is_ok(), "diags: {}", second.diagnostics);
    assert_eq!(host.recorded().creates().len(), 2);
    assert!(second.snapshot.resource(&urn("resA")).is_some());
}

// The event stream carries increasing sequence numbers with a prelude and
// a summary.
#[tokio::test]
async fn test_event_stream_ordering() {
    let host = Arc::new(TestProviderHost::new());
    let sink = CollectingSink::new();
    let result = deployment(&host)
        .with_sink(Arc::new(sink.clone()))
        .update(
            &Snapshot::empty(),
            program_of(vec![custom_resource("pkgA:index:typ", "resA", &[])]),
        )
        .await
        .unwrap();
    assert!(result.is_ok());

    let events = sink.events();
    assert!(matches!(events[0].event, EngineEvent::Prelude { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e.event, EngineEvent::Summary(_))));
    for pair in events.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
    }
    assert!(events
        .iter()
        .any(|e| matches!(&e.event, EngineEvent::ResourcePre(m) if m.urn == urn("resA"))));
}
