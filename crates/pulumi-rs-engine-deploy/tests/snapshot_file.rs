//! Snapshot file round-trips: an operation's committed snapshot survives
//! serialization with every state field and property wrapper intact.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use pulumi_rs_engine_deploy::deployment::Deployment;
use pulumi_rs_engine_deploy::testing::{custom_resource, program_of, TestProviderHost};
use pulumi_rs_engine_resource::{PropertyValue, Snapshot, Urn};

#[tokio::test]
async fn test_snapshot_survives_file_round_trip() {
    let host = Arc::new(TestProviderHost::new());
    let mut req = custom_resource("pkgA:index:typ", "resA", &[("A", "foo")]);
    req.inputs.insert(
        "password".to_string(),
        PropertyValue::secret(PropertyValue::string("hunter2")),
    );
    req.protect = true;
    req.replace_on_changes = vec!["A".to_string()];

    let result = Deployment::new("test", "test", host)
        .update(&Snapshot::empty(), program_of(vec![req]))
        .await
        .unwrap();
    assert!(result.is_ok(), "diags: {}", result.diagnostics);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    result.snapshot.save(&path).unwrap();

    // The secret wrapper is preserved in the encoding.
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains(pulumi_rs_engine_resource::property::SECRET_SIG));

    let loaded = Snapshot::load(&path).unwrap();
    assert_eq!(loaded.resources, result.snapshot.resources);

    let urn = Urn::new("test", "test", None, "pkgA:index:typ", "resA");
    let state = loaded.resource(&urn).unwrap();
    assert!(state.protect);
    assert_eq!(state.replace_on_changes, vec!["A"]);
    assert!(state.inputs.get("password").unwrap().is_secret());
}

#[tokio::test]
async fn test_corrupt_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, "{\"version\": 3, \"resources\": [{}]}").unwrap();
    assert!(Snapshot::load(&path).is_err());
}
