//! Realtime change feed over a Phoenix-framed WebSocket.
//!
//! Each table gets its own socket and channel. The channel joins with a
//! `postgres_changes` filter for that table, sends heartbeats on an interval
//! and reconnects with exponential backoff when the socket drops. History is
//! not replayed after a reconnect: events that happened during the outage
//! are lost, and a warning says so.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::SyncError;
use crate::subscriber::{ChangeFeed, EventStream};
use crate::types::{ChangeEvent, Operation, RawRow, Table};

/// Protocol version sent on connect.
const PROTOCOL_VERSION: &str = "1.0.0";

/// Buffered events per table between the socket and the subscriber pump.
const EVENT_BUFFER: usize = 1024;

/// Database schema the channels filter on.
const SCHEMA: &str = "public";

/// Change feed client for the realtime endpoint.
pub struct RealtimeClient {
    url: String,
    access_token: Option<String>,
    heartbeat: Duration,
}

impl RealtimeClient {
    /// Create a client for the project at `base_url` (`http(s)://` or `ws(s)://`).
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            url: socket_url(base_url, api_key),
            access_token: None,
            heartbeat: Duration::from_secs(30),
        }
    }

    /// Authorize row-level security as a user.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval.max(Duration::from_secs(1));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Build the socket URL from a project URL.
pub fn socket_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    let base = if base.ends_with("/websocket") {
        base
    } else {
        format!("{base}/realtime/v1/websocket")
    };
    format!("{base}?apikey={api_key}&vsn={PROTOCOL_VERSION}")
}

fn topic(table: Table) -> String {
    format!("realtime:{SCHEMA}:{}", table.name())
}

fn join_frame(table: Table, access_token: Option<&str>) -> String {
    let mut payload = json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [
                {"event": "*", "schema": SCHEMA, "table": table.name()}
            ]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": payload,
        "ref": "1",
        "join_ref": "1"
    })
    .to_string()
}

fn leave_frame(table: Table) -> String {
    json!({
        "topic": topic(table),
        "event": "phx_leave",
        "payload": {},
        "ref": "leave",
        "join_ref": "1"
    })
    .to_string()
}

fn heartbeat_frame(reference: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string()
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type", alias = "eventType")]
    kind: String,
    table: String,
    #[serde(default, alias = "new")]
    record: Option<RawRow>,
    #[serde(default, alias = "old")]
    old_record: Option<RawRow>,
}

fn non_empty(row: Option<RawRow>) -> Option<RawRow> {
    row.filter(|r| !r.is_empty())
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for control frames, and `Err(SyncError::WebSocket)`
/// when the server rejects or closes the channel.
pub fn decode_frame(text: &str) -> Result<Option<ChangeEvent>, SyncError> {
    let frame: Frame = serde_json::from_str(text)?;
    match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame.payload.get("data").unwrap_or(&frame.payload).clone();
            let change: PostgresChange = serde_json::from_value(data)?;
            Ok(Some(ChangeEvent {
                table: change.table.parse()?,
                operation: change.kind.parse::<Operation>()?,
                new_row: non_empty(change.record),
                old_row: non_empty(change.old_record),
            }))
        }
        "phx_reply" | "system" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                let detail = frame
                    .payload
                    .get("response")
                    .or_else(|| frame.payload.get("message"))
                    .cloned()
                    .unwrap_or(Value::Null);
                return Err(SyncError::WebSocket(format!(
                    "{} rejected: {detail}",
                    frame.topic
                )));
            }
            Ok(None)
        }
        "phx_error" => Err(SyncError::WebSocket(format!(
            "channel {} crashed",
            frame.topic
        ))),
        "phx_close" => Err(SyncError::WebSocket(format!(
            "channel {} closed by server",
            frame.topic
        ))),
        other => {
            trace!(event = %other, "ignoring realtime frame");
            Ok(None)
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, table: Table) -> Result<EventStream, SyncError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let channel = Channel {
            url: self.url.clone(),
            table,
            join: join_frame(table, self.access_token.as_deref()),
            heartbeat: self.heartbeat,
        };
        tokio::spawn(async move { channel.run(tx).await });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// One table's socket, owned by its own task.
struct Channel {
    url: String,
    table: Table,
    join: String,
    heartbeat: Duration,
}

impl Channel {
    /// Reconnect until the subscriber drops its stream.
    async fn run(self, tx: mpsc::Sender<ChangeEvent>) {
        let table = self.table;
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        };
        let mut connected_before = false;

        loop {
            match self.connect_and_stream(&tx, &mut backoff, &mut connected_before).await {
                Ok(()) => {
                    debug!(%table, "realtime channel released");
                    return;
                }
                Err(e) => {
                    error!(%table, error = %e, "realtime connection error, reconnecting");
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        tx: &mpsc::Sender<ChangeEvent>,
        backoff: &mut ExponentialBackoff,
        connected_before: &mut bool,
    ) -> Result<(), SyncError> {
        let table = self.table;
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::WebSocket(format!("connection failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(self.join.clone()))
            .await
            .map_err(|e| SyncError::WebSocket(format!("join failed: {e}")))?;

        backoff.reset();
        if *connected_before {
            warn!(%table, "realtime reconnected, changes made while disconnected were not replayed");
        } else {
            info!(%table, "realtime channel joined");
        }
        *connected_before = true;

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;
        let mut reference = 1u64;
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    let _ = write.send(Message::Text(leave_frame(table))).await;
                    let _ = write.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if last_frame.elapsed() > self.heartbeat * 2 {
                        return Err(SyncError::WebSocket("no frames within two heartbeats".to_string()));
                    }
                    reference += 1;
                    write
                        .send(Message::Text(heartbeat_frame(reference)))
                        .await
                        .map_err(|e| SyncError::WebSocket(format!("heartbeat failed: {e}")))?;
                }
                msg = read.next() => {
                    last_frame = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                            Ok(Some(event)) => {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(None) => {}
                            Err(e @ SyncError::WebSocket(_)) => return Err(e),
                            Err(e) => warn!(%table, error = %e, "skipping undecodable realtime frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            return Err(SyncError::WebSocket(format!("server closed socket: {frame:?}")));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SyncError::WebSocket(e.to_string())),
                        None => return Err(SyncError::WebSocket("socket stream ended".to_string())),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://abc.example.co/", "anon"),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(
            socket_url("http://localhost:54321", "k"),
            "ws://localhost:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
        assert_eq!(
            socket_url("ws://localhost:4000/socket/websocket", "k"),
            "ws://localhost:4000/socket/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn test_join_frame_filters_one_table() {
        let frame: Value = serde_json::from_str(&join_frame(Table::Tasks, Some("jwt"))).unwrap();
        assert_eq!(frame["topic"], "realtime:public:tasks");
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["payload"]["access_token"], "jwt");
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0]["table"],
            "tasks"
        );
    }

    #[test]
    fn test_decode_insert() {
        let text = r#"{
            "topic": "realtime:public:tasks",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "tasks",
                    "type": "INSERT",
                    "commit_timestamp": "2024-06-01T10:00:00Z",
                    "record": {"id": 9, "title": "New"},
                    "old_record": {}
                }
            }
        }"#;
        let event = decode_frame(text).unwrap().unwrap();
        assert_eq!(event.table, Table::Tasks);
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.new_row.unwrap()["title"], "New");
        assert_eq!(event.old_row, None);
    }

    #[test]
    fn test_decode_delete_with_empty_record() {
        let text = r#"{
            "topic": "realtime:public:task_collaborators",
            "event": "postgres_changes",
            "payload": {"data": {
                "table": "task_collaborators",
                "type": "DELETE",
                "record": {},
                "old_record": {"task_id": 5, "user_id": 2}
            }}
        }"#;
        let event = decode_frame(text).unwrap().unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.new_row, None);
        assert_eq!(event.old_row.unwrap()["user_id"], 2);
    }

    #[test]
    fn test_control_frames() {
        let ok = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        assert_eq!(decode_frame(ok).unwrap(), None);

        let rejected = r#"{"topic":"realtime:public:tasks","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(matches!(decode_frame(rejected), Err(SyncError::WebSocket(_))));

        let closed = r#"{"topic":"realtime:public:tasks","event":"phx_close","payload":{}}"#;
        assert!(matches!(decode_frame(closed), Err(SyncError::WebSocket(_))));

        let presence = r#"{"topic":"realtime:public:tasks","event":"presence_state","payload":{}}"#;
        assert_eq!(decode_frame(presence).unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_table_is_not_a_socket_error() {
        let text = r#"{"topic":"x","event":"postgres_changes","payload":{"data":{"table":"invoices","type":"INSERT","record":{"id":1}}}}"#;
        assert!(matches!(decode_frame(text), Err(SyncError::UnknownTable(_))));
    }
}
