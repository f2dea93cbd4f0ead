//! HTTP snapshot client for adapters that serve normalized snapshots.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use super::message::NormalizedMessage;
use super::source::SnapshotSource;
use crate::error::FeedError;
use crate::metrics;
use crate::orderbook::types::BookEntry;

/// Snapshot response from the adapter service.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    /// Trading pair echoed back.
    pub trading_pair: Option<String>,
    /// Update id of the snapshot; receipt time is used when absent.
    pub sequence: Option<u64>,
    /// Bid levels.
    pub bids: Option<Vec<SnapshotLevel>>,
    /// Ask levels.
    pub asks: Option<Vec<SnapshotLevel>>,
}

/// Single level or order in a snapshot response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotLevel {
    /// Price as string.
    pub price: String,
    /// Size as string.
    pub size: String,
    /// Order id for per-order feeds.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl SnapshotLevel {
    fn to_entry(&self) -> Result<BookEntry, FeedError> {
        let price = parse_decimal(&self.price)?;
        let size = parse_decimal(&self.size)?;
        Ok(BookEntry {
            price,
            size,
            order_id: self.order_id.clone(),
        })
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, FeedError> {
    raw.parse::<Decimal>()
        .map_err(|e| FeedError::ParseError(format!("invalid decimal {raw:?}: {e}")))
}

impl SnapshotResponse {
    /// Convert into a snapshot message for `trading_pair`.
    pub fn into_message(self, trading_pair: &str) -> Result<NormalizedMessage, FeedError> {
        if let Some(echoed) = &self.trading_pair {
            if echoed != trading_pair {
                return Err(FeedError::SnapshotFailed {
                    trading_pair: trading_pair.to_string(),
                    reason: format!("response was for {echoed}"),
                });
            }
        }

        let received_at = OffsetDateTime::now_utc();
        let sequence = self
            .sequence
            .unwrap_or_else(|| (received_at.unix_timestamp_nanos() / 1_000_000) as u64);

        let convert = |levels: Option<Vec<SnapshotLevel>>| -> Result<Vec<BookEntry>, FeedError> {
            levels
                .unwrap_or_default()
                .iter()
                .map(SnapshotLevel::to_entry)
                .collect()
        };

        Ok(
            NormalizedMessage::snapshot(trading_pair, sequence, convert(self.bids)?, convert(self.asks)?)
                .with_timestamp(received_at),
        )
    }
}

/// Fetches snapshots over HTTP from `{base_url}/snapshot/{pair}`.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    http: reqwest::Client,
    base_url: String,
}

impl RestSnapshotSource {
    /// Create a client with low-latency HTTP settings.
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(500))
            // TCP_NODELAY for low-latency (disable Nagle's algorithm)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Snapshot URL for a pair.
    pub fn snapshot_url(&self, trading_pair: &str) -> String {
        format!("{}/snapshot/{}", self.base_url.trim_end_matches('/'), trading_pair)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    #[instrument(skip(self))]
    async fn fetch_snapshot(&self, trading_pair: &str) -> Result<NormalizedMessage, FeedError> {
        let start = Instant::now();
        let url = self.snapshot_url(trading_pair);
        debug!(url = %url, "Fetching snapshot");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::SnapshotFailed {
                trading_pair: trading_pair.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let body: SnapshotResponse = response.json().await?;
        metrics::record_snapshot_fetch_latency(start, trading_pair);
        body.into_message(trading_pair)
    }
}
