//! Relationship patches from join tables onto their parent entity.
//!
//! A join row never becomes an entity of its own. Inserting or deleting
//! `task_collaborators(task_id, user_id)` adds or removes `user_id` in the
//! parent task's `collaborator_ids`, which is kept as a set.
//!
//! A patch for a task that is not cached yet is parked and replayed once
//! the task arrives, either from the feed or from the task snapshot.
//!
//! Until the task snapshot lands, patches that reached a cached task are also
//! remembered. A live task kept over its snapshot row starts again from the
//! snapshot's collaborators, and the patches received after the read was
//! issued are applied on top.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::cache::{Applied, CacheStore, CacheUpdate, Stored};
use crate::types::{Table, Task};

/// Maximum number of parked patches kept while waiting for a parent.
/// When exceeded, the oldest patch is dropped.
pub const MAX_PARKED_PATCHES: usize = 1_000;

/// A list field on a parent entity that a join table maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationField {
    /// `tasks.collaborator_ids`, maintained by `task_collaborators`.
    TaskCollaborators,
}

impl RelationField {
    /// The join table that drives this field.
    pub fn join_table(self) -> Table {
        match self {
            RelationField::TaskCollaborators => Table::TaskCollaborators,
        }
    }

    /// The table of the parent entity.
    pub fn parent_table(self) -> Table {
        match self {
            RelationField::TaskCollaborators => Table::Tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Remove,
}

/// Result of a relationship patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The parent's list changed.
    Applied,
    /// Duplicate add, remove of an absent child, or a stale patch.
    Unchanged,
    /// The parent is not cached yet; the patch waits for it.
    Parked,
}

/// A patch waiting for its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPatch {
    pub parent_id: String,
    pub field: RelationField,
    pub op: PatchOp,
    pub value: String,
    pub seq: u64,
}

/// Apply a set operation to an ordered id list. Returns whether it changed.
fn apply_to_set(ids: &mut Vec<String>, op: PatchOp, value: &str) -> bool {
    match op {
        PatchOp::Add => {
            if ids.iter().any(|id| id == value) {
                return false;
            }
            ids.push(value.to_string());
            true
        }
        PatchOp::Remove => {
            let before = ids.len();
            ids.retain(|id| id != value);
            ids.len() != before
        }
    }
}

impl CacheStore {
    /// Add or remove `value` in a list field of the parent entity.
    pub fn patch_relationship(
        &mut self,
        parent_id: &str,
        field: RelationField,
        op: PatchOp,
        value: &str,
        seq: u64,
    ) -> PatchOutcome {
        match field {
            RelationField::TaskCollaborators => {
                let Some(parent) = self.get::<Task>(parent_id) else {
                    self.park(PendingPatch {
                        parent_id: parent_id.to_string(),
                        field,
                        op,
                        value: value.to_string(),
                        seq,
                    });
                    return PatchOutcome::Parked;
                };

                let mut patched = parent.clone();
                let changed = apply_to_set(&mut patched.collaborator_ids, op, value);
                self.remember(PendingPatch {
                    parent_id: parent_id.to_string(),
                    field,
                    op,
                    value: value.to_string(),
                    seq,
                });
                if !changed {
                    trace!(%parent_id, %value, ?op, "relationship patch is a no-op");
                    return PatchOutcome::Unchanged;
                }

                // Raise the slot to the patch's sequence so an older snapshot
                // cannot undo it.
                let slot_seq = self
                    .collection::<Task>()
                    .seq_of(parent_id)
                    .unwrap_or_default();
                match self.upsert(patched, seq.max(slot_seq)) {
                    Applied::Updated => {
                        self.broadcast(CacheUpdate::Patched {
                            table: field.parent_table(),
                            key: parent_id.to_string(),
                        });
                        PatchOutcome::Applied
                    }
                    _ => PatchOutcome::Unchanged,
                }
            }
        }
    }

    fn remember(&mut self, patch: PendingPatch) {
        if !self.collection::<Task>().is_settled() {
            self.recent_patches.push(patch);
        }
    }

    /// Re-apply, in arrival order, the remembered patches newer than a task
    /// snapshot issued at `issued_at`, then forget them all.
    pub(crate) fn reapply_recent(&mut self, issued_at: u64) {
        let recent = std::mem::take(&mut self.recent_patches);
        let mut changed = 0;
        for patch in recent.iter().filter(|p| p.seq > issued_at) {
            let applied = Task::collection_mut(self).modify(&patch.parent_id, |task| {
                apply_to_set(&mut task.collaborator_ids, patch.op, &patch.value)
            });
            if applied {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(changed, issued_at, "re-applied live patches over task snapshot");
        }
    }

    fn park(&mut self, patch: PendingPatch) {
        if self.pending_patches.len() >= MAX_PARKED_PATCHES {
            if let Some(dropped) = self.pending_patches.pop_front() {
                warn!(
                    parent_id = %dropped.parent_id,
                    value = %dropped.value,
                    "parked patch queue full, dropping oldest patch"
                );
            }
        }
        debug!(
            parent_id = %patch.parent_id,
            value = %patch.value,
            op = ?patch.op,
            "parent not cached, parking relationship patch"
        );
        self.pending_patches.push_back(patch);
    }

    /// Replay, in arrival order, the patches parked for one parent.
    pub(crate) fn replay_parked(&mut self, parent_id: &str) {
        if !self.pending_patches.iter().any(|p| p.parent_id == parent_id) {
            return;
        }
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending_patches)
            .into_iter()
            .partition(|p| p.parent_id == parent_id);
        self.pending_patches = waiting;
        self.replay(ready);
    }

    /// Replay every parked patch whose parent is now cached.
    pub(crate) fn replay_parked_all(&mut self) {
        if self.pending_patches.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_patches);
        let tasks = self.collection::<Task>();
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = pending
            .into_iter()
            .partition(|p| tasks.contains(&p.parent_id));
        self.pending_patches = waiting;
        self.replay(ready);
    }

    fn replay(&mut self, ready: VecDeque<PendingPatch>) {
        if ready.is_empty() {
            return;
        }
        debug!(count = ready.len(), "replaying parked relationship patches");
        for patch in ready {
            self.patch_relationship(
                &patch.parent_id,
                patch.field,
                patch.op,
                &patch.value,
                patch.seq,
            );
        }
    }

    /// Drop the patches parked for a parent that was hard-deleted.
    pub(crate) fn discard_parked(&mut self, parent_id: &str) {
        let before = self.pending_patches.len();
        self.pending_patches.retain(|p| p.parent_id != parent_id);
        let dropped = before - self.pending_patches.len();
        if dropped > 0 {
            debug!(%parent_id, dropped, "discarded patches for removed parent");
        }
    }
}
