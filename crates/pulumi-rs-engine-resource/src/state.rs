use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::property::{PropertyMap, PropertyValue};
use crate::urn::Urn;

/// The hook stages a resource state can record bindings for. States only
/// persist hook names; the callbacks themselves live with the program.
pub type HookNames = BTreeMap<String, Vec<String>>;

/// The canonical record of a managed resource.
///
/// A state is immutable once appended to the journal; steps produce fresh
/// states rather than mutating committed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub urn: Urn,
    /// Provider-assigned identifier; empty while unknown (preview, partial
    /// failure with no id).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub type_token: String,
    /// True for provider-managed resources, false for components.
    #[serde(default)]
    pub custom: bool,
    /// `<provider-urn>::<provider-id>`, or empty for the root stack and for
    /// providers themselves.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub inputs: PropertyMap,
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protect: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retain_on_delete: bool,
    /// Tri-state: unset defers to the provider's diff hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_before_replace: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_on_changes: Vec<String>,
    /// When the named resource is deleted, this one is dropped from state
    /// without a provider call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_with: Option<Urn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Urn>,
    /// Created and destroyed within one operation; never snapshotted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
    /// Set during an aborted delete-before-replace so recovery knows a
    /// create is still owed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_replacement: bool,
    /// Provider-supplied: the next update must be preceded by a read.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh_before_update: bool,
    /// Normalized form of the user-supplied replacement trigger; any change
    /// forces replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_trigger: Option<PropertyValue>,
    /// Pending-delete tombstone from a delete-before-replace chain.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    /// Read from the provider rather than managed; never deleted by the
    /// engine.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    /// Names of bound resource hooks per stage, persisted so operations that
    /// run without the program can detect bindings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: HookNames,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl ResourceState {
    /// Creates a new state with the given identity and empty everything
    /// else.
    pub fn new(urn: Urn, type_token: impl Into<String>, custom: bool) -> Self {
        Self {
            urn,
            id: String::new(),
            type_token: type_token.into(),
            custom,
            provider: String::new(),
            inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            parent: None,
            dependencies: Vec::new(),
            property_dependencies: BTreeMap::new(),
            protect: false,
            retain_on_delete: false,
            delete_before_replace: None,
            replace_on_changes: Vec::new(),
            deleted_with: None,
            aliases: Vec::new(),
            ephemeral: false,
            pending_replacement: false,
            refresh_before_update: false,
            replacement_trigger: None,
            delete: false,
            external: false,
            hooks: BTreeMap::new(),
            created: None,
            modified: None,
        }
    }

    /// True when the state names a provider resource.
    pub fn is_provider(&self) -> bool {
        self.urn.is_provider()
    }

    /// Stamps the creation (and modification) time to now.
    pub fn stamp_created(&mut self) {
        let now = Utc::now();
        self.created = Some(now);
        self.modified = Some(now);
    }

    /// Stamps the modification time to now. A state that never recorded a
    /// creation time adopts it as well.
    pub fn stamp_modified(&mut self) {
        self.modified = Some(Utc::now());
        if self.created.is_none() {
            self.created = self.modified;
        }
    }

    /// The URN of the provider instance this state uses, if any.
    pub fn provider_urn(&self) -> Option<Urn> {
        let (urn, _id) = self.provider.rsplit_once("::")?;
        Urn::parse(urn).ok()
    }

    /// Every URN this state refers to: provider, parent, dependencies, and
    /// property dependencies, deduplicated.
    pub fn all_dependencies(&self) -> BTreeSet<Urn> {
        let mut deps = BTreeSet::new();
        if let Some(provider) = self.provider_urn() {
            deps.insert(provider);
        }
        if let Some(parent) = &self.parent {
            deps.insert(parent.clone());
        }
        for dep in &self.dependencies {
            deps.insert(dep.clone());
        }
        for urns in self.property_dependencies.values() {
            for urn in urns {
                deps.insert(urn.clone());
            }
        }
        deps
    }

    /// Drops every reference to the given URNs from dependencies and
    /// property dependencies. Used to elide ephemeral resources from
    /// persisted dependents.
    pub fn strip_dependencies_on(&mut self, urns: &BTreeSet<Urn>) {
        self.dependencies.retain(|d| !urns.contains(d));
        for deps in self.property_dependencies.values_mut() {
            deps.retain(|d| !urns.contains(d));
        }
        self.property_dependencies.retain(|_, deps| !deps.is_empty());
        if let Some(dw) = &self.deleted_with {
            if urns.contains(dw) {
                self.deleted_with = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyValue;

    fn urn(name: &str) -> Urn {
        Urn::new("test", "test", None, "pkgA:index:typ", name)
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = ResourceState::new(urn("resA"), "pkgA:index:typ", true);
        assert!(state.id.is_empty());
        assert!(state.custom);
        assert!(!state.protect);
        assert!(state.delete_before_replace.is_none());
        assert!(state.all_dependencies().is_empty());
    }

    #[test]
    fn test_all_dependencies_deduplicates() {
        let mut state = ResourceState::new(urn("resB"), "pkgA:index:typ", true);
        state.dependencies = vec![urn("resA"), urn("resA")];
        state
            .property_dependencies
            .insert("a".to_string(), vec![urn("resA")]);
        state.parent = Some(urn("parent"));
        let deps = state.all_dependencies();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&urn("resA")));
        assert!(deps.contains(&urn("parent")));
    }

    #[test]
    fn test_all_dependencies_includes_provider() {
        let mut state = ResourceState::new(urn("resA"), "pkgA:index:typ", true);
        let prov = Urn::new("test", "test", None, "pulumi:providers:pkgA", "default");
        state.provider = format!("{}::id-1", prov);
        assert!(state.all_dependencies().contains(&prov));
    }

    #[test]
    fn test_strip_dependencies_on() {
        let mut state = ResourceState::new(urn("resB"), "pkgA:index:typ", true);
        state.dependencies = vec![urn("resA"), urn("resC")];
        state
            .property_dependencies
            .insert("a".to_string(), vec![urn("resA")]);
        state.deleted_with = Some(urn("resA"));

        let mut gone = BTreeSet::new();
        gone.insert(urn("resA"));
        state.strip_dependencies_on(&gone);

        assert_eq!(state.dependencies, vec![urn("resC")]);
        assert!(state.property_dependencies.is_empty());
        assert!(state.deleted_with.is_none());
    }

    #[test]
    fn test_stamp_created_and_modified() {
        let mut state = ResourceState::new(urn("resA"), "pkgA:index:typ", true);
        state.stamp_created();
        let created = state.created;
        assert!(created.is_some());
        assert_eq!(state.modified, created);

        state.stamp_modified();
        assert_eq!(state.created, created);
        assert!(state.modified >= created);

        // A state that never recorded a creation time adopts one.
        let mut fresh = ResourceState::new(urn("resB"), "pkgA:index:typ", true);
        fresh.stamp_modified();
        assert_eq!(fresh.created, fresh.modified);
        assert!(fresh.created.is_some());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = ResourceState::new(urn("resA"), "pkgA:index:typ", true);
        state.id = "id-1".to_string();
        state
            .inputs
            .insert("A".to_string(), PropertyValue::string("foo"));
        state.protect = true;
        state.delete_before_replace = Some(true);

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ResourceState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
        // Unset flags are omitted from the encoding.
        assert!(!encoded.contains("retain_on_delete"));
    }
}
