use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use pulumi_rs_engine_resource::{PropertyMap, ResourceState, Snapshot, Urn};

use crate::step::{Step, StepOp};

/// The kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryKind {
    Success,
    Failure,
    Outputs,
}

/// The step payload recorded in the journal: the executed operation with
/// the final states it produced. States are immutable once recorded.
#[derive(Debug, Clone)]
pub struct CompletedStep {
    pub op: StepOp,
    pub urn: Urn,
    pub old: Option<Arc<ResourceState>>,
    pub new: Option<Arc<ResourceState>>,
    pub pending_replace: bool,
}

impl CompletedStep {
    /// Builds the record for a step, substituting the state the executor
    /// actually committed for the generator's goal state.
    pub fn from_step(step: &Step, committed: Option<Arc<ResourceState>>) -> Self {
        Self {
            op: step.op,
            urn: step.urn.clone(),
            old: step.old.clone(),
            new: committed.or_else(|| step.new.clone()),
            pending_replace: step.pending_replace,
        }
    }
}

/// One committed entry.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub kind: JournalEntryKind,
    pub step: CompletedStep,
    /// Patched outputs, for `Outputs` entries.
    pub outputs: Option<PropertyMap>,
}

/// An append-only, ordered record of committed steps. Projects to a
/// snapshot that satisfies the snapshot invariants.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<JournalEntry>>,
}

fn state_ptr(state: &Arc<ResourceState>) -> usize {
    Arc::as_ptr(state) as usize
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, step: CompletedStep) {
        self.entries.lock().unwrap().push(JournalEntry {
            kind: JournalEntryKind::Success,
            step,
            outputs: None,
        });
    }

    pub fn record_failure(&self, step: CompletedStep) {
        self.entries.lock().unwrap().push(JournalEntry {
            kind: JournalEntryKind::Failure,
            step,
            outputs: None,
        });
    }

    /// Records an outputs patch for an already-journaled resource.
    pub fn record_outputs(&self, urn: Urn, outputs: PropertyMap) {
        self.entries.lock().unwrap().push(JournalEntry {
            kind: JournalEntryKind::Outputs,
            step: CompletedStep {
                op: StepOp::Same,
                urn,
                old: None,
                new: None,
                pending_replace: false,
            },
            outputs: Some(outputs),
        });
    }

    /// A copy of the entries recorded so far, in order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Projects the journal over the base snapshot's states.
    ///
    /// Successful steps replace or remove their old states; failures keep
    /// the last known good state, except a failed delete of a replaced
    /// resource, which leaves a pending-delete tombstone. A successful
    /// delete-before-replace delete leaves a `pending_replacement`
    /// tombstone until the corresponding create commits. Base states the
    /// journal never touched are carried over unchanged.
    ///
    /// The caller is responsible for eliding ephemeral resources, fixing
    /// topological order, and verifying integrity before committing.
    pub fn snap(&self, base: &[Arc<ResourceState>]) -> Snapshot {
        let entries = self.entries();
        let base_ptrs: HashSet<usize> = base.iter().map(state_ptr).collect();

        // Slots admit later removal (a tombstone replaced by its create, or
        // a state created and deleted within the same operation).
        let mut slots: Vec<Option<ResourceState>> = Vec::new();
        let mut dones: HashSet<usize> = HashSet::new();
        let mut produced: HashMap<Urn, usize> = HashMap::new();
        let mut tombstones: HashMap<Urn, usize> = HashMap::new();

        for entry in &entries {
            let step = &entry.step;
            match entry.kind {
                JournalEntryKind::Success => match step.op {
                    StepOp::Same
                    | StepOp::Create
                    | StepOp::Update
                    | StepOp::Replace
                    | StepOp::CreateReplacement
                    | StepOp::Read
                    | StepOp::Refresh
                    | StepOp::Import => {
                        if let Some(old) = &step.old {
                            dones.insert(state_ptr(old));
                        }
                        // A successful create settles any tombstone that was
                        // owed a replacement.
                        if step.op.is_create() {
                            if let Some(slot) = tombstones.remove(&step.urn) {
                                slots[slot] = None;
                            }
                        }
                        if let Some(new) = &step.new {
                            slots.push(Some((**new).clone()));
                            produced.insert(step.urn.clone(), slots.len() - 1);
                        }
                    }
                    StepOp::Delete | StepOp::DeleteReplaced => {
                        if let Some(old) = &step.old {
                            dones.insert(state_ptr(old));
                            // Deleting a state produced earlier in this
                            // same operation (an ephemeral resource)
                            // removes its slot.
                            if !base_ptrs.contains(&state_ptr(old)) {
                                if let Some(slot) = produced.remove(&step.urn) {
                                    slots[slot] = None;
                                }
                            }
                            if step.pending_replace {
                                let mut tomb = (**old).clone();
                                tomb.delete = true;
                                tomb.pending_replacement = true;
                                slots.push(Some(tomb));
                                tombstones.insert(step.urn.clone(), slots.len() - 1);
                            }
                        }
                    }
                },
                JournalEntryKind::Failure => match step.op {
                    StepOp::Create | StepOp::CreateReplacement | StepOp::Import => {
                        // A partial failure that assigned an id is persisted
                        // so the next operation can reconcile.
                        if let Some(new) = &step.new {
                            if !new.id.is_empty() {
                                slots.push(Some((**new).clone()));
                                produced.insert(step.urn.clone(), slots.len() - 1);
                            }
                        }
                    }
                    StepOp::DeleteReplaced => {
                        // The replacement already exists; the old resource
                        // could not be deleted and becomes a pending delete.
                        if let Some(old) = &step.old {
                            dones.insert(state_ptr(old));
                            let mut tomb = (**old).clone();
                            tomb.delete = true;
                            slots.push(Some(tomb));
                        }
                    }
                    // Other failures keep the old state via carryover.
                    _ => {}
                },
                JournalEntryKind::Outputs => {
                    if let (Some(&slot), Some(outputs)) =
                        (produced.get(&step.urn), entry.outputs.as_ref())
                    {
                        if let Some(state) = slots[slot].as_mut() {
                            state.outputs = outputs.clone();
                        }
                    }
                }
            }
        }

        // Carry over base states the journal never touched.
        for state in base {
            if !dones.contains(&state_ptr(state)) {
                slots.push(Some((**state).clone()));
            }
        }

        let mut snapshot = Snapshot::empty();
        snapshot.resources = slots.into_iter().flatten().collect();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("test", "test", None, "pkgA:index:typ", name)
    }

    fn state(name: &str, id: &str) -> Arc<ResourceState> {
        let mut s = ResourceState::new(urn(name), "pkgA:index:typ", true);
        s.id = id.to_string();
        Arc::new(s)
    }

    fn success(op: StepOp, old: Option<Arc<ResourceState>>, new: Option<Arc<ResourceState>>) -> CompletedStep {
        let u = new
            .as_ref()
            .or(old.as_ref())
            .map(|s| s.urn.clone())
            .unwrap();
        CompletedStep {
            op,
            urn: u,
            old,
            new,
            pending_replace: false,
        }
    }

    #[test]
    fn test_create_appears_in_snapshot() {
        let journal = Journal::new();
        journal.record_success(success(StepOp::Create, None, Some(state("resA", "id-1"))));
        let snap = journal.snap(&[]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-1");
    }

    #[test]
    fn test_update_replaces_old_state() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_success(success(
            StepOp::Update,
            Some(old.clone()),
            Some(state("resA", "id-1b")),
        ));
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-1b");
    }

    #[test]
    fn test_delete_removes_state() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_success(success(StepOp::Delete, Some(old.clone()), None));
        let snap = journal.snap(&[old]);
        assert!(snap.resources.is_empty());
    }

    #[test]
    fn test_untouched_states_carry_over() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-1");
    }

    #[test]
    fn test_dbr_delete_without_create_leaves_pending_replacement() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_success(CompletedStep {
            op: StepOp::DeleteReplaced,
            urn: urn("resA"),
            old: Some(old.clone()),
            new: None,
            pending_replace: true,
        });
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 1);
        assert!(snap.resources[0].delete);
        assert!(snap.resources[0].pending_replacement);
    }

    #[test]
    fn test_dbr_delete_then_create_settles_tombstone() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_success(CompletedStep {
            op: StepOp::DeleteReplaced,
            urn: urn("resA"),
            old: Some(old.clone()),
            new: None,
            pending_replace: true,
        });
        journal.record_success(success(
            StepOp::CreateReplacement,
            Some(old.clone()),
            Some(state("resA", "id-2")),
        ));
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-2");
        assert!(!snap.resources[0].delete);
    }

    #[test]
    fn test_failed_deferred_delete_leaves_tombstone() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_success(success(
            StepOp::CreateReplacement,
            None,
            Some(state("resA", "id-2")),
        ));
        journal.record_failure(CompletedStep {
            op: StepOp::DeleteReplaced,
            urn: urn("resA"),
            old: Some(old.clone()),
            new: None,
            pending_replace: false,
        });
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 2);
        let live: Vec<_> = snap.resources.iter().filter(|r| !r.delete).collect();
        let tombs: Vec<_> = snap.resources.iter().filter(|r| r.delete).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "id-2");
        assert_eq!(tombs.len(), 1);
        assert_eq!(tombs[0].id, "id-1");
    }

    #[test]
    fn test_partial_create_failure_persists_assigned_id() {
        let journal = Journal::new();
        journal.record_failure(success(StepOp::Create, None, Some(state("resA", "id-partial"))));
        let snap = journal.snap(&[]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-partial");
    }

    #[test]
    fn test_failed_create_without_id_is_not_persisted() {
        let journal = Journal::new();
        journal.record_failure(success(StepOp::Create, None, Some(state("resA", ""))));
        assert!(journal.snap(&[]).resources.is_empty());
    }

    #[test]
    fn test_outputs_patch_produced_state() {
        let journal = Journal::new();
        journal.record_success(success(StepOp::Create, None, Some(state("comp", "id"))));
        let mut outputs = PropertyMap::new();
        outputs.insert(
            "endpoint".to_string(),
            pulumi_rs_engine_resource::PropertyValue::string("https://example.com"),
        );
        journal.record_outputs(urn("comp"), outputs.clone());
        let snap = journal.snap(&[]);
        assert_eq!(snap.resources[0].outputs, outputs);
    }

    #[test]
    fn test_failed_update_keeps_last_known_good() {
        let old = state("resA", "id-1");
        let journal = Journal::new();
        journal.record_failure(success(
            StepOp::Update,
            Some(old.clone()),
            Some(state("resA", "id-1")),
        ));
        let snap = journal.snap(&[old]);
        assert_eq!(snap.resources.len(), 1);
        assert_eq!(snap.resources[0].id, "id-1");
    }
}
