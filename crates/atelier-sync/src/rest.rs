//! Snapshot reads over the PostgREST-style HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use reqwest::Client;
use tracing::{debug, warn};

use crate::SyncError;
use crate::config::SyncConfig;
use crate::loader::SnapshotSource;
use crate::types::{RawRow, Table};

/// Default rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default time spent retrying one page before giving up.
const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(30);

/// HTTP client for full-table reads.
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    page_size: usize,
    retry_budget: Duration,
}

impl RestClient {
    /// Create a client for the project at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    /// Create a client with the page size and timeout from `config`.
    pub fn from_config(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        Ok(Self::with_timeout(base_url, api_key, config.request_timeout())?
            .with_page_size(config.page_size))
    }

    fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
        })
    }

    /// Authenticate reads as a user instead of with the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Total time to keep retrying a transient failure of one page.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Columns to select. Task reads embed their collaborators.
    fn select_for(table: Table) -> &'static str {
        match table {
            Table::Tasks => "*,task_collaborators(user_id)",
            _ => "*",
        }
    }

    /// Check if an error is transient and worth retrying.
    fn is_transient_error(err: &SyncError) -> bool {
        match err {
            SyncError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    async fn get_page(&self, table: Table, offset: usize) -> Result<Vec<RawRow>, SyncError> {
        let url = format!("{}/rest/v1/{}", self.base_url, table.name());
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);

        let mut query: Vec<(&str, String)> = vec![
            ("select", Self::select_for(table).to_string()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if table == Table::Tasks {
            query.push(("order", "id.desc".to_string()));
        }

        let response = self
            .http
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                table,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Read one page, retrying transient failures with exponential backoff.
    async fn fetch_page(&self, table: Table, offset: usize) -> Result<Vec<RawRow>, SyncError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        loop {
            match self.get_page(table, offset).await {
                Ok(rows) => return Ok(rows),
                Err(e) if Self::is_transient_error(&e) => match backoff.next_backoff() {
                    Some(wait) => {
                        debug!(
                            %table,
                            offset,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "transient error reading snapshot page, retrying"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        warn!(%table, offset, error = %e, "retry budget exhausted");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    /// Page through the table until a short page comes back.
    async fn fetch(&self, table: Table) -> Result<Vec<RawRow>, SyncError> {
        let mut rows = Vec::new();
        loop {
            let page = self.fetch_page(table, rows.len()).await?;
            let done = page.len() < self.page_size;
            rows.extend(page);
            if done {
                break;
            }
        }
        debug!(%table, rows = rows.len(), "snapshot read complete");
        Ok(rows)
    }
}
