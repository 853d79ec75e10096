//! Concurrent bulk load of every collection.
//!
//! Each collection is read independently. A read is tagged with the sequence
//! clock when it is issued, and its result goes to the dispatcher as soon as
//! it settles, so a slow or failing collection never holds back the others.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::cache::{CacheStore, SeqClock};
use crate::dispatch::{Dispatched, Envelope, apply};
use crate::types::{RawRow, Table};

/// Source of full-table snapshot reads.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Read every row of `table`.
    async fn fetch(&self, table: Table) -> Result<Vec<RawRow>, SyncError>;
}

/// Load state of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Pending,
    Loaded { rows: usize, rejected: usize },
    Failed { error: String },
}

impl LoadStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, LoadStatus::Pending)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStatus::Pending => f.write_str("pending"),
            LoadStatus::Loaded { rows, rejected: 0 } => write!(f, "{rows} rows"),
            LoadStatus::Loaded { rows, rejected } => {
                write!(f, "{rows} rows ({rejected} rejected)")
            }
            LoadStatus::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Synchronization state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing was requested.
    Disconnected,
    /// Snapshot reads are still outstanding; live events are already applied.
    Syncing,
    /// Every collection has settled.
    Live,
}

/// Per-collection load status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadProgress {
    statuses: BTreeMap<Table, LoadStatus>,
}

/// Final load progress, once every collection has settled.
pub type LoadReport = LoadProgress;

impl LoadProgress {
    /// Every table starts out pending.
    pub fn pending(tables: &[Table]) -> Self {
        Self {
            statuses: tables.iter().map(|t| (*t, LoadStatus::Pending)).collect(),
        }
    }

    /// Record the outcome of a snapshot message. Returns whether anything changed.
    pub fn record(&mut self, dispatched: &Dispatched) -> bool {
        let (table, status) = match dispatched {
            Dispatched::Seeded { table, outcome } => (
                *table,
                LoadStatus::Loaded {
                    rows: outcome.loaded + outcome.kept_live,
                    rejected: outcome.rejected,
                },
            ),
            Dispatched::SnapshotFailed { table, error } => (
                *table,
                LoadStatus::Failed {
                    error: error.clone(),
                },
            ),
            _ => return false,
        };
        self.statuses.insert(table, status);
        true
    }

    pub fn get(&self, table: Table) -> Option<&LoadStatus> {
        self.statuses.get(&table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Table, &LoadStatus)> {
        self.statuses.iter().map(|(t, s)| (*t, s))
    }

    pub fn is_settled(&self) -> bool {
        self.statuses.values().all(LoadStatus::is_settled)
    }

    pub fn state(&self) -> SyncState {
        if self.statuses.is_empty() {
            SyncState::Disconnected
        } else if self.is_settled() {
            SyncState::Live
        } else {
            SyncState::Syncing
        }
    }

    /// Collections whose read failed.
    pub fn failed(&self) -> impl Iterator<Item = (Table, &str)> {
        self.statuses.iter().filter_map(|(t, s)| match s {
            LoadStatus::Failed { error } => Some((*t, error.as_str())),
            _ => None,
        })
    }
}

/// Issues one snapshot read per collection.
pub struct BulkLoader {
    source: Arc<dyn SnapshotSource>,
    clock: SeqClock,
    tables: Vec<Table>,
}

impl BulkLoader {
    pub fn new(source: Arc<dyn SnapshotSource>, clock: SeqClock) -> Self {
        Self {
            source,
            clock,
            tables: Table::COLLECTIONS.to_vec(),
        }
    }

    /// Restrict the load to these tables.
    pub fn tables(mut self, tables: impl IntoIterator<Item = Table>) -> Self {
        self.tables = tables.into_iter().collect();
        self
    }

    /// Issue every read concurrently and forward each result as it settles.
    ///
    /// Fails only when the dispatcher is gone.
    pub async fn run(&self, tx: mpsc::Sender<Envelope>) -> Result<(), SyncError> {
        info!(tables = self.tables.len(), "starting bulk load");

        // Tag each read before it is polled.
        let mut reads: FuturesUnordered<_> = self
            .tables
            .iter()
            .map(|&table| {
                let issued_at = self.clock.tick();
                let source = Arc::clone(&self.source);
                async move { (table, issued_at, source.fetch(table).await) }
            })
            .collect();

        while let Some((table, issued_at, result)) = reads.next().await {
            match &result {
                Ok(rows) => debug!(%table, issued_at, rows = rows.len(), "snapshot read settled"),
                Err(e) => warn!(%table, error = %e, "snapshot read failed"),
            }
            tx.send(Envelope::snapshot(issued_at, table, result))
                .await
                .map_err(|_| SyncError::Closed)?;
        }
        Ok(())
    }

    /// Load straight into `store`, without a dispatcher task.
    pub async fn load_all(&self, store: &mut CacheStore) -> LoadReport {
        let mut report = LoadProgress::pending(&self.tables);
        // One slot per table, so the loader never waits on the drain below.
        let (tx, mut rx) = mpsc::channel(self.tables.len().max(1));
        if let Err(e) = self.run(tx).await {
            warn!(error = %e, "bulk load interrupted");
        }
        while let Some(envelope) = rx.recv().await {
            let dispatched = apply(store, envelope);
            report.record(&dispatched);
        }
        report
    }
}
