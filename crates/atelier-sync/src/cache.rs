//! In-memory cache for the canonical collections.
//!
//! Every slot remembers the sequence it was written at. Together with the
//! per-key removal markers this lets the cache accept events and snapshots
//! in any interleaving without an older write undoing a newer one.
//!
//! Removal markers are only needed while a collection's snapshot read is
//! outstanding. Once it has been applied, or has failed, the collection is
//! settled: markers are dropped and no new ones are recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::NormalizeError;
use crate::normalize::Normalize;
use crate::patcher::PendingPatch;
use crate::types::{
    Absence, Client, Entity, Holiday, Project, ProjectMember, Table, Task, TimesheetEntry, User,
};

/// Capacity of the cache update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 4096;

/// Process-local monotonic counter shared by the loader and the subscriber.
#[derive(Debug, Clone, Default)]
pub struct SeqClock(Arc<AtomicU64>);

impl SeqClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new value. Never returns 0.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last value handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a new key lands in its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    Front,
    Back,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    seq: u64,
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    /// Same value already cached; nothing observable changed.
    Unchanged,
    /// Refused: the slot or a removal marker is newer than the write.
    Stale,
}

impl Applied {
    pub fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Updated)
    }
}

/// Result of a remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// Key was not cached. Before the collection settles the removal
    /// marker is still recorded.
    Absent,
    Stale,
}

/// What a sequence-aware replacement did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    /// Rows taken from the snapshot.
    pub loaded: usize,
    /// Live rows newer than the snapshot that were kept instead.
    pub kept_live: usize,
    /// Snapshot rows dropped because the key was removed after the read was issued.
    pub skipped_removed: usize,
}

/// An ordered, keyed collection of one entity kind.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    slots: IndexMap<String, Slot<T>>,
    removed: HashMap<String, u64>,
    insert_at: InsertAt,
    revision: u64,
    settled: bool,
}

impl<T: Entity> Collection<T> {
    pub fn new(insert_at: InsertAt) -> Self {
        Self {
            slots: IndexMap::new(),
            removed: HashMap::new(),
            insert_at,
            revision: 0,
            settled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Sequence the cached value for `key` was written at.
    pub fn seq_of(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.seq)
    }

    /// Values in store order, tombstoned rows included.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.values().map(|slot| &slot.value)
    }

    /// Bumped on every observable change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the collection's snapshot has been applied or has failed.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Number of removal markers currently held.
    pub fn removal_markers(&self) -> usize {
        self.removed.len()
    }

    /// Stop tracking removals. Called once no snapshot read is outstanding.
    pub fn settle(&mut self) {
        self.settled = true;
        self.removed.clear();
    }

    /// Edit a cached value in place, keeping its sequence. `edit` returns
    /// whether it changed anything.
    pub(crate) fn modify(&mut self, key: &str, edit: impl FnOnce(&mut T) -> bool) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        let changed = edit(&mut slot.value);
        if changed {
            self.revision += 1;
        }
        changed
    }

    fn removed_after(&self, key: &str, seq: u64) -> bool {
        self.removed.get(key).is_some_and(|marker| *marker > seq)
    }

    pub fn upsert(&mut self, value: T, seq: u64) -> Applied {
        let key = value.key().to_string();
        if self.removed_after(&key, seq) {
            return Applied::Stale;
        }
        self.removed.remove(&key);

        if let Some(slot) = self.slots.get_mut(&key) {
            if slot.seq > seq {
                return Applied::Stale;
            }
            if slot.value == value {
                slot.seq = slot.seq.max(seq);
                return Applied::Unchanged;
            }
            *slot = Slot { value, seq };
            self.revision += 1;
            return Applied::Updated;
        }

        let slot = Slot { value, seq };
        match self.insert_at {
            InsertAt::Front => {
                self.slots.shift_insert(0, key, slot);
            }
            InsertAt::Back => {
                self.slots.insert(key, slot);
            }
        }
        self.revision += 1;
        Applied::Inserted
    }

    pub fn remove(&mut self, key: &str, seq: u64) -> Removal {
        if self.slots.get(key).is_some_and(|slot| slot.seq > seq) {
            return Removal::Stale;
        }
        if !self.settled {
            let marker = self.removed.entry(key.to_string()).or_insert(seq);
            *marker = (*marker).max(seq);
        }

        match self.slots.shift_remove(key) {
            Some(_) => {
                self.revision += 1;
                Removal::Removed
            }
            None => Removal::Absent,
        }
    }

    /// Replace the whole collection with a snapshot read issued at `issued_at`.
    ///
    /// Rows written by live events after the read was issued win over the
    /// snapshot, and keys removed after it stay removed. A kept live value
    /// still takes the snapshot-only fields through [`Entity::merge_snapshot`].
    /// The collection is settled afterwards.
    pub fn replace_all(&mut self, items: Vec<T>, issued_at: u64) -> ReplaceSummary {
        let mut previous = std::mem::take(&mut self.slots);
        let mut next: IndexMap<String, Slot<T>> = IndexMap::with_capacity(items.len());
        let mut summary = ReplaceSummary::default();

        for value in items {
            let key = value.key().to_string();
            if self.removed_after(&key, issued_at) {
                summary.skipped_removed += 1;
                continue;
            }
            match previous.shift_remove(&key) {
                Some(mut live) if live.seq > issued_at => {
                    summary.kept_live += 1;
                    live.value.merge_snapshot(&value);
                    next.insert(key, live);
                }
                _ => {
                    summary.loaded += 1;
                    next.insert(
                        key,
                        Slot {
                            value,
                            seq: issued_at,
                        },
                    );
                }
            }
        }

        // Live rows the snapshot never saw.
        let newer: Vec<(String, Slot<T>)> = previous
            .into_iter()
            .filter(|(_, slot)| slot.seq > issued_at)
            .collect();
        summary.kept_live += newer.len();
        match self.insert_at {
            InsertAt::Front => {
                for (key, slot) in newer.into_iter().rev() {
                    next.shift_insert(0, key, slot);
                }
            }
            InsertAt::Back => next.extend(newer),
        }

        self.slots = next;
        self.revision += 1;
        self.settle();
        summary
    }

    /// First value matching `predicate`, in store order.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        self.iter().find(|value| predicate(value))
    }
}

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A row was inserted or changed.
    Upserted {
        table: Table,
        key: String,
        created: bool,
    },
    /// A row was hard-deleted.
    Removed { table: Table, key: String },
    /// A relationship list on a row changed.
    Patched { table: Table, key: String },
    /// A collection was seeded from a snapshot.
    Replaced { table: Table, rows: usize },
    /// A raw row was dropped during normalization.
    Rejected { table: Table, reason: String },
}

/// A cached entity kind, with accessors for its collection in the store.
pub trait Stored: Entity + Normalize {
    fn collection(store: &CacheStore) -> &Collection<Self>;
    fn collection_mut(store: &mut CacheStore) -> &mut Collection<Self>;
}

macro_rules! impl_stored {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(
            impl Stored for $ty {
                fn collection(store: &CacheStore) -> &Collection<Self> {
                    &store.$field
                }

                fn collection_mut(store: &mut CacheStore) -> &mut Collection<Self> {
                    &mut store.$field
                }
            }
        )*
    };
}

impl_stored! {
    Client => clients,
    Project => projects,
    Task => tasks,
    TimesheetEntry => timesheets,
    ProjectMember => project_members,
    Absence => absences,
    Holiday => holidays,
    User => users,
}

/// The session's cache: one collection per kind plus parked relationship patches.
pub struct CacheStore {
    clients: Collection<Client>,
    projects: Collection<Project>,
    tasks: Collection<Task>,
    timesheets: Collection<TimesheetEntry>,
    project_members: Collection<ProjectMember>,
    absences: Collection<Absence>,
    holidays: Collection<Holiday>,
    users: Collection<User>,

    /// Join patches waiting for their parent task, in arrival order.
    pub(crate) pending_patches: VecDeque<PendingPatch>,
    /// Join patches applied to cached tasks before the task snapshot landed.
    pub(crate) recent_patches: Vec<PendingPatch>,

    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            clients: Collection::new(InsertAt::Back),
            projects: Collection::new(InsertAt::Back),
            // Newest tasks first, matching the snapshot's `id.desc` order.
            tasks: Collection::new(InsertAt::Front),
            timesheets: Collection::new(InsertAt::Back),
            project_members: Collection::new(InsertAt::Back),
            absences: Collection::new(InsertAt::Back),
            holidays: Collection::new(InsertAt::Back),
            users: Collection::new(InsertAt::Back),
            pending_patches: VecDeque::new(),
            recent_patches: Vec::new(),
            updates_tx,
        }
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    pub(crate) fn broadcast(&self, update: CacheUpdate) {
        let _ = self.updates_tx.send(update);
    }

    pub fn collection<T: Stored>(&self) -> &Collection<T> {
        T::collection(self)
    }

    pub fn get<T: Stored>(&self, key: &str) -> Option<&T> {
        T::collection(self).get(key)
    }

    pub fn upsert<T: Stored>(&mut self, value: T, seq: u64) -> Applied {
        let key = value.key().to_string();
        let applied = T::collection_mut(self).upsert(value, seq);
        trace!(table = %T::TABLE, %key, seq, ?applied, "upsert");

        if applied.changed() {
            self.broadcast(CacheUpdate::Upserted {
                table: T::TABLE,
                key: key.clone(),
                created: applied == Applied::Inserted,
            });
        }
        if T::TABLE == Table::Tasks && applied == Applied::Inserted {
            self.replay_parked(&key);
        }
        applied
    }

    pub fn remove<T: Stored>(&mut self, key: &str, seq: u64) -> Removal {
        let removal = T::collection_mut(self).remove(key, seq);
        trace!(table = %T::TABLE, %key, seq, ?removal, "remove");

        if removal == Removal::Removed {
            self.broadcast(CacheUpdate::Removed {
                table: T::TABLE,
                key: key.to_string(),
            });
        }
        if T::TABLE == Table::Tasks && removal != Removal::Stale {
            self.discard_parked(key);
        }
        removal
    }

    pub fn replace_all<T: Stored>(&mut self, items: Vec<T>, issued_at: u64) -> ReplaceSummary {
        let summary = T::collection_mut(self).replace_all(items, issued_at);
        let rows = T::collection(self).len();
        debug!(
            table = %T::TABLE,
            issued_at,
            rows,
            kept_live = summary.kept_live,
            skipped_removed = summary.skipped_removed,
            "collection replaced"
        );

        self.broadcast(CacheUpdate::Replaced {
            table: T::TABLE,
            rows,
        });
        if T::TABLE == Table::Tasks {
            self.reapply_recent(issued_at);
            self.replay_parked_all();
        }
        summary
    }

    /// Settle the collection behind `table` without a snapshot, after its
    /// read failed.
    pub fn settle(&mut self, table: Table) {
        match table {
            Table::Clients => self.clients.settle(),
            Table::Projects => self.projects.settle(),
            Table::Tasks => {
                self.tasks.settle();
                self.recent_patches.clear();
            }
            Table::Timesheets => self.timesheets.settle(),
            Table::ProjectMembers => self.project_members.settle(),
            Table::Absences => self.absences.settle(),
            Table::Holidays => self.holidays.settle(),
            Table::Users => self.users.settle(),
            Table::TaskCollaborators => {}
        }
    }

    /// Report a raw row that failed normalization.
    pub fn reject(&self, table: Table, error: &NormalizeError) {
        warn!(%table, error = %error, "dropping row that failed normalization");
        self.broadcast(CacheUpdate::Rejected {
            table,
            reason: error.to_string(),
        });
    }

    /// Revision of the collection backing `table`. The join table maps to tasks.
    pub fn revision(&self, table: Table) -> u64 {
        match table {
            Table::Clients => self.clients.revision(),
            Table::Projects => self.projects.revision(),
            Table::Tasks | Table::TaskCollaborators => self.tasks.revision(),
            Table::Timesheets => self.timesheets.revision(),
            Table::ProjectMembers => self.project_members.revision(),
            Table::Absences => self.absences.revision(),
            Table::Holidays => self.holidays.revision(),
            Table::Users => self.users.revision(),
        }
    }

    /// Row counts per collection, tombstoned rows included.
    pub fn counts(&self) -> BTreeMap<Table, usize> {
        BTreeMap::from([
            (Table::Clients, self.clients.len()),
            (Table::Projects, self.projects.len()),
            (Table::Tasks, self.tasks.len()),
            (Table::Timesheets, self.timesheets.len()),
            (Table::ProjectMembers, self.project_members.len()),
            (Table::Absences, self.absences.len()),
            (Table::Holidays, self.holidays.len()),
            (Table::Users, self.users.len()),
        ])
    }

    /// Number of relationship patches waiting for a parent.
    pub fn parked_patches(&self) -> usize {
        self.pending_patches.len()
    }
}
