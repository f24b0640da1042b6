//! Bookkeeping - records identities and connections on an HTTP backend
//!
//! Writes are fire-and-forget: [`record_peer`] and [`record_connection`]
//! spawn the request and only log failures.

use crate::config::BookkeepingConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BookkeepingError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend answered {status}")]
    Status { status: u16 },
}

/// A registered identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: String,
}

/// One established call, seen from `identity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub identity: String,
    pub connected_to: String,
}

#[async_trait]
pub trait Bookkeeper: Send + Sync {
    async fn record_peer(&self, record: PeerRecord) -> Result<(), BookkeepingError>;

    async fn record_connection(&self, record: ConnectionRecord) -> Result<(), BookkeepingError>;
}

/// POSTs records as JSON to `{base}/peers` and `{base}/connections`
pub struct HttpBookkeeper {
    http: reqwest::Client,
    base: String,
}

impl HttpBookkeeper {
    pub fn new(config: &BookkeepingConfig) -> Result<Self, BookkeepingError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), BookkeepingError> {
        let url = format!("{}/{}", self.base, path);
        let response = self.http.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BookkeepingError::Status {
                status: status.as_u16(),
            });
        }

        tracing::debug!("Recorded {} ({})", path, status);
        Ok(())
    }
}

#[async_trait]
impl Bookkeeper for HttpBookkeeper {
    async fn record_peer(&self, record: PeerRecord) -> Result<(), BookkeepingError> {
        self.post("peers", &record).await
    }

    async fn record_connection(&self, record: ConnectionRecord) -> Result<(), BookkeepingError> {
        self.post("connections", &record).await
    }
}

/// Spawns a peer write; failures are logged at `warn`
pub fn record_peer(bookkeeper: &Arc<dyn Bookkeeper>, identity: &str) {
    let bookkeeper = Arc::clone(bookkeeper);
    let record = PeerRecord {
        identity: identity.to_string(),
    };
    tokio::spawn(async move {
        if let Err(e) = bookkeeper.record_peer(record).await {
            tracing::warn!("Failed to record peer: {}", e);
        }
    });
}

/// Spawns a connection write; failures are logged at `warn`
pub fn record_connection(bookkeeper: &Arc<dyn Bookkeeper>, identity: &str, connected_to: &str) {
    let bookkeeper = Arc::clone(bookkeeper);
    let record = ConnectionRecord {
        identity: identity.to_string(),
        connected_to: connected_to.to_string(),
    };
    tokio::spawn(async move {
        if let Err(e) = bookkeeper.record_connection(record).await {
            tracing::warn!("Failed to record connection: {}", e);
        }
    });
}

// ============================================================================
// TESTS
// ============================================================================
