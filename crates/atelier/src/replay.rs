//! Offline replay of a snapshot and an event log.
//!
//! The snapshot file is a JSON object mapping table names to row arrays. The
//! event log holds one change event per line:
//!
//! ```text
//! {"table": "projects", "operation": "update", "newRow": {"id": 1, "name": "Alpha Renamed"}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Events are applied in
//! file order after the snapshot has been loaded.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use atelier_sync::{
    BulkLoader, CacheStore, ChangeEvent, Dispatched, MemoryBackend, SeqClock, SyncError, Table,
    dispatch,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot: {0}")]
    Snapshot(#[source] serde_json::Error),

    #[error("invalid event on line {line}: {source}")]
    Event {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Parse an event log, one JSON event per line.
pub fn parse_events(text: &str) -> Result<Vec<ChangeEvent>, ReplayError> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, text)| {
            serde_json::from_str(text).map_err(|source| ReplayError::Event { line, source })
        })
        .collect()
}

/// Load `snapshot` through the in-memory backend, then apply `events` in order.
pub async fn run(snapshot: &Value, events: &[ChangeEvent]) -> Result<CacheStore, ReplayError> {
    let backend = MemoryBackend::from_snapshot_json(snapshot)?;
    let clock = SeqClock::new();
    let mut store = CacheStore::new();

    let report = BulkLoader::new(backend, clock.clone())
        .tables(Table::COLLECTIONS)
        .load_all(&mut store)
        .await;
    debug!(settled = report.is_settled(), "snapshot loaded");

    let mut rejected = 0;
    for event in events {
        if let Dispatched::Rejected { table, error } = dispatch(&mut store, event, clock.tick()) {
            warn!(%table, %error, "event rejected");
            rejected += 1;
        }
    }
    info!(events = events.len(), rejected, "replay complete");
    Ok(store)
}

/// Read both files and replay them.
pub async fn run_files(snapshot: &Path, events: &Path) -> Result<CacheStore, ReplayError> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.display().to_string(),
            source,
        })
    };

    let snapshot: Value = serde_json::from_str(&read(snapshot)?).map_err(ReplayError::Snapshot)?;
    let events = parse_events(&read(events)?)?;
    run(&snapshot, &events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_sync::{Operation, Project, Task, visible};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_events_skips_blank_and_comment_lines() {
        let text = r#"
# seed
{"table": "projects", "operation": "update", "newRow": {"id": 1, "name": "B"}}

{"table": "tasks", "operation": "DELETE", "oldRow": {"id": 9}}
"#;
        let events = parse_events(text).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].table, Table::Projects);
        assert_eq!(events[1].table, Table::Tasks);
        assert_eq!(events[1].operation, Operation::Delete);
        assert!(events[1].new_row.is_none());
    }

    #[test]
    fn test_parse_events_reports_line() {
        let text = "{\"table\": \"tasks\", \"operation\": \"insert\"}\nnot json\n";
        let err = parse_events(text).unwrap_err();
        assert!(matches!(err, ReplayError::Event { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_replay_applies_events_after_snapshot() {
        let snapshot = json!({
            "projects": [{"id": 1, "name": "Alpha"}],
            "tasks": [{"id": 5, "title": "Deploy", "task_collaborators": []}]
        });
        let events = parse_events(
            r#"{"table": "projects", "operation": "update", "newRow": {"id": 1, "name": "Alpha Renamed"}}
{"table": "task_collaborators", "operation": "insert", "newRow": {"task_id": 5, "user_id": 2}}
{"table": "task_collaborators", "operation": "insert", "newRow": {"task_id": 5, "user_id": 2}}
{"table": "tasks", "operation": "insert", "newRow": {"title": "no id"}}"#,
        )
        .unwrap();

        let store = run(&snapshot, &events).await.unwrap();

        let projects = visible(store.collection::<Project>());
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "Alpha Renamed");
        assert_eq!(
            store.get::<Task>("5").unwrap().collaborator_ids,
            vec!["2".to_string()]
        );
        assert_eq!(store.collection::<Task>().len(), 1);
    }

    #[tokio::test]
    async fn test_run_files() {
        let mut snapshot = tempfile::NamedTempFile::new().unwrap();
        write!(snapshot, r#"{{"holidays": [{{"id": 1, "name": "Natal"}}]}}"#).unwrap();
        let mut events = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            events,
            r#"{{"table": "holidays", "operation": "delete", "oldRow": {{"id": 1}}}}"#
        )
        .unwrap();

        let store = run_files(snapshot.path(), events.path()).await.unwrap();
        assert!(store.collection::<atelier_sync::Holiday>().is_empty());
    }

    #[tokio::test]
    async fn test_run_files_missing_snapshot() {
        let events = tempfile::NamedTempFile::new().unwrap();
        let result = run_files(Path::new("/nonexistent/snapshot.json"), events.path()).await;
        assert!(matches!(result, Err(ReplayError::Io { .. })));
    }
}
