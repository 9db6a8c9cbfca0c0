use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::ResourceState;
use crate::urn::Urn;

/// The snapshot file format version this crate writes.
pub const SNAPSHOT_VERSION: u32 = 3;

/// Errors produced while verifying or persisting snapshots.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("duplicate resource {0}")]
    DuplicateUrn(Urn),
    #[error("resource {0} refers to unknown resource {1}")]
    DanglingReference(Urn, Urn),
    #[error("resource {0} refers to resource {1} which appears later in the snapshot")]
    OutOfOrderReference(Urn, Urn),
    #[error("resource {0} is ephemeral and must not appear in a snapshot")]
    EphemeralResource(Urn),
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Metadata describing the operation that produced a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub time: DateTime<Utc>,
    pub version: String,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            time: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// An operation that may have been in flight when a snapshot was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Creating,
    Updating,
    Deleting,
    Reading,
}

/// A pending operation recorded for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub resource_urn: Urn,
    #[serde(rename = "type")]
    pub operation: OperationType,
}

/// An ordered list of resource states representing the committed world at
/// the end of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub manifest: Option<Manifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_provider: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<PendingOperation>,
}

/// The on-disk file wrapper: a versioned header around the snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    #[serde(flatten)]
    snapshot: Snapshot,
}

impl Snapshot {
    /// Creates an empty snapshot with a fresh manifest.
    pub fn empty() -> Self {
        Self {
            manifest: Some(Manifest::default()),
            ..Default::default()
        }
    }

    /// Looks up the live (non-tombstone) state for a URN.
    pub fn resource(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| &r.urn == urn && !r.delete)
    }

    /// Verifies the snapshot invariants:
    ///
    /// 1. at most one live state per URN (tombstones excepted);
    /// 2. every parent/provider/dependency reference points to a state that
    ///    appears earlier in the list;
    /// 3. no dangling references;
    /// 4. no ephemeral resource appears, and none is referenced.
    pub fn verify_integrity(&self) -> Result<(), SnapshotError> {
        let mut live: HashSet<&Urn> = HashSet::new();
        let mut seen: HashSet<&Urn> = HashSet::new();
        let all: HashSet<&Urn> = self.resources.iter().map(|r| &r.urn).collect();

        for state in &self.resources {
            if state.ephemeral {
                return Err(SnapshotError::EphemeralResource(state.urn.clone()));
            }
            if !state.delete && !live.insert(&state.urn) {
                return Err(SnapshotError::DuplicateUrn(state.urn.clone()));
            }
            for dep in state.all_dependencies() {
                if !all.contains(&dep) {
                    return Err(SnapshotError::DanglingReference(state.urn.clone(), dep));
                }
                if !seen.contains(&dep) {
                    return Err(SnapshotError::OutOfOrderReference(state.urn.clone(), dep));
                }
            }
            if let Some(dw) = &state.deleted_with {
                if !all.contains(dw) {
                    return Err(SnapshotError::DanglingReference(
                        state.urn.clone(),
                        dw.clone(),
                    ));
                }
            }
            seen.insert(&state.urn);
        }
        Ok(())
    }

    /// Reorders resources topologically (providers and parents first),
    /// preserving the relative order of unrelated resources. States whose
    /// antecedents are missing are kept, to be caught by
    /// [`Snapshot::verify_integrity`].
    pub fn normalize_order(&mut self) {
        let mut indexed: HashMap<Urn, usize> = HashMap::new();
        for (i, state) in self.resources.iter().enumerate() {
            indexed.entry(state.urn.clone()).or_insert(i);
        }

        let mut emitted: HashSet<usize> = HashSet::new();
        let mut order: Vec<usize> = Vec::with_capacity(self.resources.len());

        fn visit(
            i: usize,
            resources: &[ResourceState],
            indexed: &HashMap<Urn, usize>,
            emitted: &mut HashSet<usize>,
            order: &mut Vec<usize>,
            visiting: &mut HashSet<usize>,
        ) {
            if emitted.contains(&i) || !visiting.insert(i) {
                return;
            }
            for dep in resources[i].all_dependencies() {
                if let Some(&j) = indexed.get(&dep) {
                    visit(j, resources, indexed, emitted, order, visiting);
                }
            }
            visiting.remove(&i);
            emitted.insert(i);
            order.push(i);
        }

        let mut visiting = HashSet::new();
        for i in 0..self.resources.len() {
            visit(
                i,
                &self.resources,
                &indexed,
                &mut emitted,
                &mut order,
                &mut visiting,
            );
        }

        let mut reordered = Vec::with_capacity(self.resources.len());
        for i in order {
            reordered.push(self.resources[i].clone());
        }
        self.resources = reordered;
    }

    /// Removes every ephemeral state and strips references to them from the
    /// remaining states.
    pub fn elide_ephemeral(&mut self) {
        let gone: BTreeSet<Urn> = self
            .resources
            .iter()
            .filter(|r| r.ephemeral)
            .map(|r| r.urn.clone())
            .collect();
        if gone.is_empty() {
            return;
        }
        self.resources.retain(|r| !r.ephemeral);
        for state in &mut self.resources {
            state.strip_dependencies_on(&gone);
        }
    }

    /// Writes the snapshot to a file, verifying integrity first.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        self.verify_integrity()?;
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            snapshot: self.clone(),
        };
        let encoded = serde_json::to_string_pretty(&file)?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Loads a snapshot from a file and verifies it.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = fs::read_to_string(path)?;
        let file: SnapshotFile = serde_json::from_str(&raw)?;
        file.snapshot.verify_integrity()?;
        Ok(file.snapshot)
    }
}
