//! Live commands against a running backend.

use std::sync::Arc;

use miette::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use atelier_sync::{
    BulkLoader, CacheStore, LoadReport, LoadStatus, RealtimeClient, RestClient, SeqClock,
    Session, SessionContext, SyncConfig,
};

use crate::Connection;
use crate::report;

fn rest_client(connection: &Connection, config: &SyncConfig) -> Result<RestClient> {
    let client = RestClient::from_config(&connection.url, &connection.api_key, config)
        .map_err(|e| miette::miette!("failed to create REST client: {}", e))?;
    Ok(match &connection.access_token {
        Some(token) => client.with_access_token(token),
        None => client,
    })
}

fn realtime_client(connection: &Connection, config: &SyncConfig) -> RealtimeClient {
    let url = connection.realtime_url.as_deref().unwrap_or(&connection.url);
    let client = RealtimeClient::new(url, &connection.api_key).with_heartbeat(config.heartbeat());
    match &connection.access_token {
        Some(token) => client.with_access_token(token),
        None => client,
    }
}

fn log_report(report: &LoadReport) {
    for (table, status) in report.iter() {
        match status {
            LoadStatus::Failed { error } => warn!(%table, %error, "collection failed to load"),
            status => info!(%table, %status, "collection settled"),
        }
    }
}

/// Open a session and follow the change feed until Ctrl-C.
pub async fn run(connection: &Connection) -> Result<()> {
    let config = connection.sync_config()?;
    let source = Arc::new(rest_client(connection, &config)?);
    let feed = Arc::new(realtime_client(connection, &config));

    info!(url = %connection.url, "starting watch");
    let session = Session::open(SessionContext::new(source, feed).with_config(config))
        .await
        .map_err(|e| miette::miette!("failed to open session: {}", e))?;

    let mut updates = session.updates().await;
    let ready = tokio::select! {
        report = session.ready() => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(report) = ready else {
        info!("interrupted during bulk load");
        session.close().await;
        return Ok(());
    };
    log_report(&report.map_err(|e| miette::miette!("{}", e))?);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    info!(?update, counts = ?session.views().counts(), "cache updated");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update log lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    session.close().await;
    Ok(())
}

/// Bulk load once, without subscribing, and print the views.
pub async fn snapshot(connection: &Connection) -> Result<()> {
    let config = connection.sync_config()?;
    let source = Arc::new(rest_client(connection, &config)?);

    let mut store = CacheStore::new();
    let report = BulkLoader::new(source, SeqClock::new())
        .tables(config.collections())
        .load_all(&mut store)
        .await;
    log_report(&report);

    report::print(&store)
}
