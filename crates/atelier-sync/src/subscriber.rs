//! Change feed subscription.
//!
//! One subscription per table, each drained by its own pump task into the
//! dispatcher channel. Events are tagged with the sequence clock when the
//! pump receives them, which is what lets the cache order them against
//! snapshot reads.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::cache::SeqClock;
use crate::dispatch::Envelope;
use crate::types::{ChangeEvent, Table};

/// Events of one table, in the order the feed delivered them.
pub type EventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// A source of row-level change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to one table. Dropping the stream unsubscribes.
    async fn subscribe(&self, table: Table) -> Result<EventStream, SyncError>;
}

/// Subscribes to every configured table and forwards events to the dispatcher.
pub struct ChangeFeedSubscriber {
    feed: Arc<dyn ChangeFeed>,
    clock: SeqClock,
    tables: Vec<Table>,
}

impl ChangeFeedSubscriber {
    pub fn new(feed: Arc<dyn ChangeFeed>, clock: SeqClock) -> Self {
        Self {
            feed,
            clock,
            tables: Table::ALL.to_vec(),
        }
    }

    /// Restrict the subscription to these tables.
    pub fn tables(mut self, tables: impl IntoIterator<Item = Table>) -> Self {
        self.tables = tables.into_iter().collect();
        self
    }

    /// Subscribe to every table and start one pump per table.
    ///
    /// If any table fails to subscribe, the pumps already started are closed
    /// before the error is returned.
    pub async fn subscribe(&self, tx: mpsc::Sender<Envelope>) -> Result<FeedHandle, SyncError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handle = FeedHandle {
            shutdown_tx,
            pumps: Vec::with_capacity(self.tables.len()),
        };

        for &table in &self.tables {
            let stream = match self.feed.subscribe(table).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%table, error = %e, "change feed subscription failed");
                    handle.close().await;
                    return Err(e);
                }
            };
            debug!(%table, "subscribed to change feed");
            handle.pumps.push(tokio::spawn(pump(
                table,
                stream,
                self.clock.clone(),
                tx.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(tables = self.tables.len(), "change feed subscribed");
        Ok(handle)
    }
}

async fn pump(
    table: Table,
    mut stream: EventStream,
    clock: SeqClock,
    tx: mpsc::Sender<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!(%table, "change feed pump shutting down");
                break;
            }
            next = stream.next() => {
                let Some(event) = next else {
                    info!(%table, "change feed ended");
                    break;
                };
                if event.table != table {
                    warn!(%table, event_table = %event.table, "dropping event for another table");
                    continue;
                }
                let seq = clock.tick();
                if tx.send(Envelope::change(seq, event)).await.is_err() {
                    debug!(%table, "dispatcher gone, stopping pump");
                    break;
                }
            }
        }
    }
}

/// Live subscription handle. Close it before subscribing again.
pub struct FeedHandle {
    shutdown_tx: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
}

impl FeedHandle {
    /// Stop every pump and wait for them. Dropping the streams unsubscribes.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        for pump in std::mem::take(&mut self.pumps) {
            let _ = pump.await;
        }
        debug!("change feed closed");
    }

    /// Number of pumps still running.
    pub fn active(&self) -> usize {
        self.pumps.iter().filter(|p| !p.is_finished()).count()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StoreMessage;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_stream::wrappers::ReceiverStream;

    /// Hands out pre-built streams, or fails for tables without one.
    struct ScriptedFeed {
        streams: Mutex<Vec<(Table, mpsc::Receiver<ChangeEvent>)>>,
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn subscribe(&self, table: Table) -> Result<EventStream, SyncError> {
            let mut streams = self.streams.lock().unwrap();
            let index = streams
                .iter()
                .position(|(t, _)| *t == table)
                .ok_or_else(|| SyncError::WebSocket(format!("no channel for {table}")))?;
            let (_, rx) = streams.remove(index);
            Ok(Box::pin(ReceiverStream::new(rx)))
        }
    }

    fn event(table: Table, id: u64) -> ChangeEvent {
        match json!({"id": id}) {
            serde_json::Value::Object(row) => ChangeEvent::insert(table, row),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_events_are_tagged_on_receipt() {
        let (users_tx, users_rx) = mpsc::channel(8);
        let feed = Arc::new(ScriptedFeed {
            streams: Mutex::new(vec![(Table::Users, users_rx)]),
        });
        let clock = SeqClock::new();
        clock.tick();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = ChangeFeedSubscriber::new(feed, clock.clone())
            .tables([Table::Users])
            .subscribe(tx)
            .await
            .unwrap();

        users_tx.send(event(Table::Users, 1)).await.unwrap();
        users_tx.send(event(Table::Clients, 2)).await.unwrap();
        users_tx.send(event(Table::Users, 3)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq), (2, 3));
        match second.message {
            StoreMessage::Change(e) => assert_eq!(e.new_row.unwrap()["id"], 3),
            other => panic!("unexpected message {other:?}"),
        }

        handle.close().await;
    }

    #[tokio::test]
    async fn test_partial_subscribe_failure_closes_started_pumps() {
        let (_users_tx, users_rx) = mpsc::channel(8);
        let feed = Arc::new(ScriptedFeed {
            streams: Mutex::new(vec![(Table::Users, users_rx)]),
        });

        let (tx, _rx) = mpsc::channel(8);
        let result = ChangeFeedSubscriber::new(feed, SeqClock::new())
            .tables([Table::Users, Table::Tasks])
            .subscribe(tx)
            .await;

        assert!(matches!(result, Err(SyncError::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_close_stops_pumps() {
        let (_users_tx, users_rx) = mpsc::channel(8);
        let feed = Arc::new(ScriptedFeed {
            streams: Mutex::new(vec![(Table::Users, users_rx)]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ChangeFeedSubscriber::new(feed, SeqClock::new())
            .tables([Table::Users])
            .subscribe(tx)
            .await
            .unwrap();
        assert_eq!(handle.active(), 1);

        handle.close().await;
        // Every sender clone lived in a pump, so the channel is now closed.
        assert!(rx.recv().await.is_none());
    }
}
