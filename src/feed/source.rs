//! Boundary contracts with feed adapters, plus a mock snapshot source.
//!
//! Push feeds hand the tracker an `mpsc::Receiver<FeedEvent>`; pull-style
//! full snapshots come from a [`SnapshotSource`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::message::NormalizedMessage;
use crate::error::FeedError;
use crate::orderbook::types::BookEntry;

/// Event delivered by a push feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A normalized market-data message.
    Message(NormalizedMessage),
    /// The feed reconnected; books may have missed diffs and need a resnapshot.
    Reconnected,
}

/// Pull-style source of full book snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch a full snapshot for `trading_pair`.
    async fn fetch_snapshot(&self, trading_pair: &str) -> Result<NormalizedMessage, FeedError>;
}

/// Exponential backoff settings for reconnects and snapshot retries.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_s: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_s: 30,
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Create with a custom ceiling.
    pub fn with_max_delay(max_delay_s: u64) -> Self {
        Self {
            max_delay_s,
            ..Default::default()
        }
    }

    /// Calculate next delay with exponential backoff.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(63) as i32);
        let max_delay_ms = self.max_delay_s * 1000;
        let clamped_ms = delay_ms.min(max_delay_ms as f64) as u64;
        Duration::from_millis(clamped_ms)
    }
}

/// Configuration for mock source behavior.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Number of leading fetches that fail before succeeding.
    pub fail_first: u32,
    /// Simulated latency in milliseconds.
    pub latency_ms: u64,
}

/// Mock snapshot source for testing.
///
/// Pairs without a configured snapshot get an empty book at sequence 0.
#[derive(Debug, Clone, Default)]
pub struct MockSnapshotSource {
    config: MockConfig,
    snapshots: Arc<Mutex<HashMap<String, NormalizedMessage>>>,
    fetches: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockSnapshotSource {
    /// Create a new mock source with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock source with custom configuration.
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Set the snapshot returned for a pair.
    pub fn set_snapshot(&self, snapshot: NormalizedMessage) {
        self.snapshots
            .lock()
            .insert(snapshot.trading_pair.clone(), snapshot);
    }

    /// How many times a pair's snapshot was requested.
    pub fn fetch_count(&self, trading_pair: &str) -> u32 {
        self.fetches.lock().get(trading_pair).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshotSource {
    async fn fetch_snapshot(&self, trading_pair: &str) -> Result<NormalizedMessage, FeedError> {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let attempt = {
            let mut fetches = self.fetches.lock();
            let count = fetches.entry(trading_pair.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt <= self.config.fail_first {
            return Err(FeedError::SnapshotFailed {
                trading_pair: trading_pair.to_string(),
                reason: "Mock snapshot failure".to_string(),
            });
        }

        let snapshot = self.snapshots.lock().get(trading_pair).cloned();
        Ok(snapshot.unwrap_or_else(|| {
            NormalizedMessage::snapshot(trading_pair, 0, Vec::new(), Vec::new())
        }))
    }
}

/// Builder for snapshot messages with common patterns.
pub struct SnapshotBuilder {
    trading_pair: String,
    sequence: u64,
    bids: Vec<BookEntry>,
    asks: Vec<BookEntry>,
}

impl SnapshotBuilder {
    /// Create a new builder for the given pair and sequence.
    pub fn new(trading_pair: impl Into<String>, sequence: u64) -> Self {
        Self {
            trading_pair: trading_pair.into(),
            sequence,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Add a bid level.
    pub fn bid(mut self, price: Decimal, size: Decimal) -> Self {
        self.bids.push(BookEntry::level(price, size));
        self
    }

    /// Add an ask level.
    pub fn ask(mut self, price: Decimal, size: Decimal) -> Self {
        self.asks.push(BookEntry::level(price, size));
        self
    }

    /// Two levels each side around the given touch.
    pub fn with_spread(mut self, best_bid: Decimal, best_ask: Decimal, depth: Decimal) -> Self {
        let tick = Decimal::new(1, 2);
        self.bids = vec![
            BookEntry::level(best_bid, depth),
            BookEntry::level(best_bid - tick, depth * Decimal::TWO),
        ];
        self.asks = vec![
            BookEntry::level(best_ask, depth),
            BookEntry::level(best_ask + tick, depth * Decimal::TWO),
        ];
        self
    }

    /// Build the snapshot message.
    pub fn build(self) -> NormalizedMessage {
        NormalizedMessage::snapshot(self.trading_pair, self.sequence, self.bids, self.asks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::message::MessageKind;
    use rust_decimal_macros::dec;

    #[test]
    fn backoff_grows_and_clamps() {
        let backoff = BackoffConfig::with_max_delay(5);
        assert_eq!(backoff.next_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(10), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn mock_returns_configured_snapshot() {
        let source = MockSnapshotSource::new();
        source.set_snapshot(
            SnapshotBuilder::new("BTC-USDT", 100)
                .with_spread(dec!(10), dec!(11), dec!(5))
                .build(),
        );

        let snapshot = source.fetch_snapshot("BTC-USDT").await.unwrap();
        assert_eq!(snapshot.kind, MessageKind::Snapshot);
        assert_eq!(snapshot.sequence, 100);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(source.fetch_count("BTC-USDT"), 1);
    }

    #[tokio::test]
    async fn mock_defaults_to_empty_snapshot() {
        let source = MockSnapshotSource::new();
        let snapshot = source.fetch_snapshot("ETH-USDT").await.unwrap();

        assert_eq!(snapshot.trading_pair, "ETH-USDT");
        assert!(snapshot.bids.is_empty() && snapshot.asks.is_empty());
    }

    #[tokio::test]
    async fn mock_failure_modes() {
        let source = MockSnapshotSource::with_config(MockConfig {
            fail_first: 2,
            ..Default::default()
        });

        assert!(source.fetch_snapshot("A-B").await.is_err());
        assert!(source.fetch_snapshot("A-B").await.is_err());
        assert!(source.fetch_snapshot("A-B").await.is_ok());
        assert_eq!(source.fetch_count("A-B"), 3);
    }
}
