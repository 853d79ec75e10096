//! Session lifecycle.
//!
//! A session wires one dispatcher task to two producers:
//! 1. Start the dispatcher (sole writer of the store)
//! 2. Subscribe the change feed (events are applied as soon as they arrive)
//! 3. Start the bulk loader (each collection is seeded as its read settles)
//!
//! Closing stops the producers first, then lets the dispatcher drain what is
//! already queued and exit.

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::cache::{CacheStore, CacheUpdate, SeqClock};
use crate::config::SyncConfig;
use crate::dispatch::{Dispatched, Envelope, apply};
use crate::loader::{BulkLoader, LoadProgress, LoadReport, SnapshotSource, SyncState};
use crate::subscriber::{ChangeFeed, ChangeFeedSubscriber, FeedHandle};
use crate::views::{ViewPublisher, Views};

/// Everything a session needs from the outside.
pub struct SessionContext {
    pub source: Arc<dyn SnapshotSource>,
    pub feed: Arc<dyn ChangeFeed>,
    pub config: SyncConfig,
}

impl SessionContext {
    pub fn new(source: Arc<dyn SnapshotSource>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            source,
            feed,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }
}

/// An open sync session.
pub struct Session {
    store: Arc<RwLock<CacheStore>>,
    views: Views,
    progress_rx: watch::Receiver<LoadProgress>,
    feed: Option<FeedHandle>,
    loader: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a session: start the dispatcher, subscribe, then bulk load.
    pub async fn open(ctx: SessionContext) -> Result<Self, SyncError> {
        let SessionContext {
            source,
            feed,
            config,
        } = ctx;
        config.validate()?;

        let store = Arc::new(RwLock::new(CacheStore::new()));
        let (publisher, views) = ViewPublisher::channel();
        let collections = config.collections();
        let (progress_tx, progress_rx) = watch::channel(LoadProgress::pending(&collections));
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let clock = SeqClock::new();

        info!(
            tables = config.tables.len(),
            collections = collections.len(),
            "opening sync session"
        );

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&store),
            publisher,
            progress_tx,
            rx,
        ));

        let subscriber = ChangeFeedSubscriber::new(feed, clock.clone()).tables(config.tables.clone());
        let feed = match subscriber.subscribe(tx.clone()).await {
            Ok(feed) => feed,
            Err(e) => {
                // Dropping the last sender lets the dispatcher exit.
                drop(tx);
                let _ = dispatcher.await;
                return Err(e);
            }
        };

        let loader = BulkLoader::new(source, clock).tables(collections);
        let loader = tokio::spawn(async move {
            if let Err(e) = loader.run(tx).await {
                debug!(error = %e, "bulk load stopped early");
            }
        });

        Ok(Self {
            store,
            views,
            progress_rx,
            feed: Some(feed),
            loader: Some(loader),
            dispatcher: Some(dispatcher),
        })
    }

    /// Filtered read views.
    pub fn views(&self) -> &Views {
        &self.views
    }

    /// The raw store, tombstoned rows included.
    pub fn store(&self) -> Arc<RwLock<CacheStore>> {
        Arc::clone(&self.store)
    }

    /// Load progress, updated as each collection settles.
    pub fn progress(&self) -> watch::Receiver<LoadProgress> {
        self.progress_rx.clone()
    }

    pub fn state(&self) -> SyncState {
        self.progress_rx.borrow().state()
    }

    /// Subscribe to cache updates.
    pub async fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.store.read().await.subscribe()
    }

    /// Wait until every collection has settled, loaded or failed.
    pub async fn ready(&self) -> Result<LoadReport, SyncError> {
        let mut rx = self.progress_rx.clone();
        let report = rx
            .wait_for(LoadProgress::is_settled)
            .await
            .map_err(|_| SyncError::Closed)?
            .clone();
        Ok(report)
    }

    /// Close the feed, stop the loader, and wait for the dispatcher to drain.
    pub async fn close(mut self) {
        if let Some(feed) = self.feed.take() {
            feed.close().await;
        }
        if let Some(loader) = self.loader.take() {
            loader.abort();
            let _ = loader.await;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }
        info!("sync session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(loader) = &self.loader {
            loader.abort();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.abort();
        }
    }
}

/// Apply envelopes one at a time, each under the store's write lock.
async fn run_dispatcher(
    store: Arc<RwLock<CacheStore>>,
    mut publisher: ViewPublisher,
    progress_tx: watch::Sender<LoadProgress>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let dispatched = {
            let mut store = store.write().await;
            let dispatched = apply(&mut store, envelope);
            if let Some(table) = dispatched.touched() {
                publisher.refresh(&store, table);
            }
            dispatched
        };

        if matches!(
            dispatched,
            Dispatched::Seeded { .. } | Dispatched::SnapshotFailed { .. }
        ) {
            progress_tx.send_if_modified(|progress| {
                let changed = progress.record(&dispatched);
                if changed && progress.is_settled() {
                    info!(
                        failed = progress.failed().count(),
                        "all collections settled, session is live"
                    );
                }
                changed
            });
        }
    }
    debug!("dispatcher drained");
}
