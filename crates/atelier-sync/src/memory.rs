//! In-process backend for tests and offline replay.
//!
//! Holds snapshot rows per table and fans change events out over a
//! broadcast channel. Snapshot reads can be held at a gate so a test can
//! interleave live events with an outstanding bulk load.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::SyncError;
use crate::loader::SnapshotSource;
use crate::subscriber::{ChangeFeed, EventStream};
use crate::types::{ChangeEvent, RawRow, Table};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Default)]
struct State {
    rows: HashMap<Table, Vec<RawRow>>,
    failing: HashSet<Table>,
}

/// Snapshot rows and a change feed, all in memory.
pub struct MemoryBackend {
    state: Mutex<State>,
    events_tx: broadcast::Sender<ChangeEvent>,
    gate: watch::Sender<bool>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(State::default()),
            events_tx,
            gate,
        })
    }

    /// Build a backend from a JSON object mapping table names to row arrays.
    pub fn from_snapshot_json(json: &Value) -> Result<Arc<Self>, SyncError> {
        let Value::Object(tables) = json else {
            return Err(SyncError::Config(
                "snapshot must be an object of table name to rows".to_string(),
            ));
        };

        let backend = Self::new();
        for (name, rows) in tables {
            let table: Table = name.parse()?;
            let Value::Array(rows) = rows else {
                return Err(SyncError::Config(format!("rows of {table} must be an array")));
            };
            let rows = rows
                .iter()
                .filter_map(|row| match row {
                    Value::Object(map) => Some(map.clone()),
                    other => {
                        warn!(%table, row = %other, "skipping non-object snapshot row");
                        None
                    }
                })
                .collect();
            backend.set_rows(table, rows);
        }
        Ok(backend)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the snapshot rows of a table.
    pub fn set_rows(&self, table: Table, rows: Vec<RawRow>) {
        self.state().rows.insert(table, rows);
    }

    /// Make snapshot reads of `table` fail.
    pub fn fail_table(&self, table: Table) {
        self.state().failing.insert(table);
    }

    /// Block snapshot reads until [`release_snapshots`](Self::release_snapshots).
    pub fn hold_snapshots(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_snapshots(&self) {
        self.gate.send_replace(true);
    }

    /// Publish a change event to every subscriber of its table. Returns the
    /// number of live subscriptions it reached.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        self.events_tx.send(event).unwrap_or(0)
    }

    /// Number of open table subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }
}

#[async_trait]
impl SnapshotSource for MemoryBackend {
    async fn fetch(&self, table: Table) -> Result<Vec<RawRow>, SyncError> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| SyncError::Closed)?;

        let state = self.state();
        if state.failing.contains(&table) {
            return Err(SyncError::Snapshot {
                table,
                message: "simulated read failure".to_string(),
            });
        }
        let rows = state.rows.get(&table).cloned().unwrap_or_default();
        debug!(%table, rows = rows.len(), "memory snapshot read");
        Ok(rows)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, table: Table) -> Result<EventStream, SyncError> {
        let stream = BroadcastStream::new(self.events_tx.subscribe()).filter_map(move |item| {
            let event = match item {
                Ok(event) if event.table == table => Some(event),
                Ok(_) => None,
                Err(e) => {
                    warn!(%table, error = %e, "memory feed lagged, events were lost");
                    None
                }
            };
            async move { event }
        });
        Ok(Box::pin(stream))
    }
}
