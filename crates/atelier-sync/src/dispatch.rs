//! Message dispatch onto the cache.
//!
//! Everything that mutates the cache arrives as an [`Envelope`]: either the
//! result of a snapshot read, or one change event from the feed. The
//! dispatcher task applies envelopes one at a time through [`apply`].
//!
//! The per-table handling is generated by `define_table_dispatch!`, so adding
//! a collection is one line in the invocation below plus its entity type,
//! `Normalize` impl and `Stored` impl.
//!
//! Routing is keyed by `(table, operation)`:
//!
//! | table          | insert / update          | delete                         |
//! |----------------|--------------------------|--------------------------------|
//! | primary tables | normalize `new_row`, upsert | key from `old_row`, remove  |
//! | join table     | add child to parent list | remove child from parent list  |

use tracing::{debug, error, trace};

use crate::cache::{Applied, CacheStore, Removal, Stored};
use crate::normalize::{RowKey, collaborator_pair, row_key};
use crate::patcher::{PatchOp, PatchOutcome, RelationField};
use crate::types::{
    Absence, ChangeEvent, Client, Holiday, Operation, Project, ProjectMember, RawRow, Table, Task,
    TimesheetEntry, User,
};
use crate::{NormalizeError, SyncError};

/// Payload of a dispatcher message.
#[derive(Debug)]
pub enum StoreMessage {
    /// A snapshot read settled.
    Snapshot {
        table: Table,
        result: Result<Vec<RawRow>, SyncError>,
    },
    /// One event from the change feed.
    Change(ChangeEvent),
}

/// A message tagged with its sequence: receipt time for events, issue time
/// for snapshot reads.
#[derive(Debug)]
pub struct Envelope {
    pub seq: u64,
    pub message: StoreMessage,
}

impl Envelope {
    pub fn change(seq: u64, event: ChangeEvent) -> Self {
        Self {
            seq,
            message: StoreMessage::Change(event),
        }
    }

    pub fn snapshot(seq: u64, table: Table, result: Result<Vec<RawRow>, SyncError>) -> Self {
        Self {
            seq,
            message: StoreMessage::Snapshot { table, result },
        }
    }
}

/// What seeding one collection did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub loaded: usize,
    pub rejected: usize,
    pub kept_live: usize,
    pub skipped_removed: usize,
}

/// What one envelope did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Seeded {
        table: Table,
        outcome: SnapshotOutcome,
    },
    SnapshotFailed {
        table: Table,
        error: String,
    },
    Upserted {
        table: Table,
        key: String,
        applied: Applied,
    },
    Removed {
        table: Table,
        key: String,
        removal: Removal,
    },
    Patched {
        parent_id: String,
        outcome: PatchOutcome,
    },
    Rejected {
        table: Table,
        error: NormalizeError,
    },
}

impl Dispatched {
    /// The table whose visible view may have changed.
    pub fn touched(&self) -> Option<Table> {
        match self {
            Dispatched::Seeded { table, .. } => Some(*table),
            Dispatched::Upserted { table, applied, .. } if applied.changed() => Some(*table),
            Dispatched::Removed {
                table,
                removal: Removal::Removed,
                ..
            } => Some(*table),
            Dispatched::Patched {
                outcome: PatchOutcome::Applied,
                ..
            } => Some(Table::Tasks),
            _ => None,
        }
    }
}

/// Macro to define per-table dispatch for every cached collection.
///
/// # Syntax
///
/// ```ignore
/// define_table_dispatch! {
///     // Table variant => entity type
///     Clients => Client,
/// }
/// ```
///
/// The join table is not listed; it is routed to the relationship patcher.
macro_rules! define_table_dispatch {
    ( $( $table:ident => $type:ty ),* $(,)? ) => {
        /// Seed one collection from a settled snapshot read.
        fn apply_snapshot(
            store: &mut CacheStore,
            table: Table,
            rows: Vec<RawRow>,
            issued_at: u64,
        ) -> SnapshotOutcome {
            match table {
                $( Table::$table => seed::<$type>(store, rows, issued_at), )*
                Table::TaskCollaborators => seed_join(store, rows, issued_at),
            }
        }

        /// Normalize a row and upsert it into its collection.
        fn upsert_row(
            store: &mut CacheStore,
            table: Table,
            raw: &RawRow,
            seq: u64,
        ) -> Result<Dispatched, NormalizeError> {
            match table {
                $( Table::$table => upsert_entity::<$type>(store, raw, seq), )*
                Table::TaskCollaborators => patch_join(store, raw, PatchOp::Add, seq),
            }
        }

        /// Remove the row identified by `raw` from its collection.
        fn remove_row(
            store: &mut CacheStore,
            table: Table,
            raw: &RawRow,
            seq: u64,
        ) -> Result<Dispatched, NormalizeError> {
            let key = match row_key(table, raw)? {
                RowKey::Key(key) => key,
                RowKey::RowId(row_id) => match member_by_row_id(store, &row_id) {
                    Some(key) => key,
                    None => {
                        trace!(%table, %row_id, "delete for unknown row id");
                        return Ok(Dispatched::Removed {
                            table,
                            key: row_id,
                            removal: Removal::Absent,
                        });
                    }
                },
            };
            match table {
                $( Table::$table => Ok(remove_entity::<$type>(store, key, seq)), )*
                Table::TaskCollaborators => patch_join(store, raw, PatchOp::Remove, seq),
            }
        }
    };
}

define_table_dispatch! {
    Clients => Client,
    Projects => Project,
    Tasks => Task,
    Timesheets => TimesheetEntry,
    ProjectMembers => ProjectMember,
    Absences => Absence,
    Holidays => Holiday,
    Users => User,
}

fn seed<T: Stored>(store: &mut CacheStore, rows: Vec<RawRow>, issued_at: u64) -> SnapshotOutcome {
    let mut rejected = 0;
    let items: Vec<T> = rows
        .iter()
        .filter_map(|raw| match T::normalize(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                store.reject(T::TABLE, &e);
                rejected += 1;
                None
            }
        })
        .collect();

    let summary = store.replace_all(items, issued_at);
    SnapshotOutcome {
        loaded: summary.loaded,
        rejected,
        kept_live: summary.kept_live,
        skipped_removed: summary.skipped_removed,
    }
}

/// Join rows read in bulk are applied as add patches at the read's sequence.
fn seed_join(store: &mut CacheStore, rows: Vec<RawRow>, issued_at: u64) -> SnapshotOutcome {
    let mut outcome = SnapshotOutcome::default();
    for raw in &rows {
        match patch_join(store, raw, PatchOp::Add, issued_at) {
            Ok(_) => outcome.loaded += 1,
            Err(e) => {
                store.reject(Table::TaskCollaborators, &e);
                outcome.rejected += 1;
            }
        }
    }
    outcome
}

fn upsert_entity<T: Stored>(
    store: &mut CacheStore,
    raw: &RawRow,
    seq: u64,
) -> Result<Dispatched, NormalizeError> {
    let mut value = T::normalize(raw)?;
    if let Some(previous) = store.get::<T>(value.key()) {
        value.carry_over(previous, raw);
    }
    let key = value.key().to_string();
    let applied = store.upsert(value, seq);
    Ok(Dispatched::Upserted {
        table: T::TABLE,
        key,
        applied,
    })
}

fn remove_entity<T: Stored>(store: &mut CacheStore, key: String, seq: u64) -> Dispatched {
    let removal = store.remove::<T>(&key, seq);
    Dispatched::Removed {
        table: T::TABLE,
        key,
        removal,
    }
}

fn member_by_row_id(store: &CacheStore, row_id: &str) -> Option<String> {
    store
        .collection::<ProjectMember>()
        .find(|member| member.row_id.as_deref() == Some(row_id))
        .map(|member| member.key.clone())
}

fn patch_join(
    store: &mut CacheStore,
    raw: &RawRow,
    op: PatchOp,
    seq: u64,
) -> Result<Dispatched, NormalizeError> {
    let (task_id, user_id) = collaborator_pair(raw)?;
    let outcome =
        store.patch_relationship(&task_id, RelationField::TaskCollaborators, op, &user_id, seq);
    Ok(Dispatched::Patched {
        parent_id: task_id,
        outcome,
    })
}

/// An update of a join row moves the pair: remove the old one, add the new one.
fn move_join(
    store: &mut CacheStore,
    event: &ChangeEvent,
    new_row: &RawRow,
    seq: u64,
) -> Result<Dispatched, NormalizeError> {
    let new_pair = collaborator_pair(new_row)?;
    let removed = match event.old_row.as_ref().map(collaborator_pair) {
        Some(Ok(old_pair)) if old_pair != new_pair => {
            let outcome = store.patch_relationship(
                &old_pair.0,
                RelationField::TaskCollaborators,
                PatchOp::Remove,
                &old_pair.1,
                seq,
            );
            outcome == PatchOutcome::Applied
        }
        _ => false,
    };

    let added = patch_join(store, new_row, PatchOp::Add, seq)?;
    Ok(match added {
        Dispatched::Patched {
            parent_id,
            outcome: PatchOutcome::Unchanged,
        } if removed => Dispatched::Patched {
            parent_id,
            outcome: PatchOutcome::Applied,
        },
        other => other,
    })
}

fn require<'a>(
    row: Option<&'a RawRow>,
    event: &ChangeEvent,
) -> Result<&'a RawRow, NormalizeError> {
    row.ok_or(NormalizeError::MissingRow {
        table: event.table,
        operation: event.operation,
    })
}

/// Apply one change event at sequence `seq`.
///
/// Never fails: rows that cannot be normalized are dropped and reported as
/// [`Dispatched::Rejected`].
pub fn dispatch(store: &mut CacheStore, event: &ChangeEvent, seq: u64) -> Dispatched {
    let result = match (event.table, event.operation) {
        (Table::TaskCollaborators, Operation::Update) => {
            require(event.new_row.as_ref(), event).and_then(|row| move_join(store, event, row, seq))
        }
        (table, Operation::Insert | Operation::Update) => {
            require(event.new_row.as_ref(), event).and_then(|row| upsert_row(store, table, row, seq))
        }
        (table, Operation::Delete) => {
            require(event.old_row.as_ref().or(event.new_row.as_ref()), event)
                .and_then(|row| remove_row(store, table, row, seq))
        }
    };

    result.unwrap_or_else(|error| {
        store.reject(event.table, &error);
        Dispatched::Rejected {
            table: event.table,
            error,
        }
    })
}

/// Apply one dispatcher message.
pub fn apply(store: &mut CacheStore, envelope: Envelope) -> Dispatched {
    let Envelope { seq, message } = envelope;
    match message {
        StoreMessage::Snapshot {
            table,
            result: Ok(rows),
        } => {
            let outcome = apply_snapshot(store, table, rows, seq);
            debug!(
                %table,
                issued_at = seq,
                loaded = outcome.loaded,
                rejected = outcome.rejected,
                "snapshot applied"
            );
            Dispatched::Seeded { table, outcome }
        }
        StoreMessage::Snapshot {
            table,
            result: Err(e),
        } => {
            error!(%table, error = %e, "snapshot read failed, collection stays empty");
            store.settle(table);
            Dispatched::SnapshotFailed {
                table,
                error: e.to_string(),
            }
        }
        StoreMessage::Change(event) => dispatch(store, &event, seq),
    }
}
