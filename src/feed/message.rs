//! Normalized feed message shared by every adapter.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

use crate::error::MessageError;
use crate::orderbook::types::{BookEntry, Side};

/// Kind of feed event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    /// Full replacement of the book.
    Snapshot,
    /// Incremental level changes.
    Diff,
    /// Trade print.
    Trade,
}

/// How a feed reports book changes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeedKind {
    /// Entries are aggregate price levels.
    #[default]
    #[serde(alias = "aggregate")]
    #[strum(to_string = "aggregate_levels", serialize = "aggregate")]
    AggregateLevels,
    /// Entries are individual orders keyed by `order_id`.
    PerOrder,
}

/// Trade print details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TradeInfo {
    /// Execution price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Executed size.
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Exchange trade id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

/// One feed event for one trading pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMessage {
    /// Event kind.
    pub kind: MessageKind,
    /// Normalized trading pair, e.g. "BTC-USDT".
    pub trading_pair: String,
    /// Ordering and idempotency key.
    pub sequence: u64,
    /// Bid entries.
    #[serde(default)]
    pub bids: Vec<BookEntry>,
    /// Ask entries.
    #[serde(default)]
    pub asks: Vec<BookEntry>,
    /// Trade details, set for trades only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade: Option<TradeInfo>,
    /// Wall-clock receipt time. Diagnostics only, never used for ordering.
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub timestamp: OffsetDateTime,
}

impl NormalizedMessage {
    /// Create a snapshot message.
    pub fn snapshot(
        trading_pair: impl Into<String>,
        sequence: u64,
        bids: Vec<BookEntry>,
        asks: Vec<BookEntry>,
    ) -> Self {
        Self::book(MessageKind::Snapshot, trading_pair, sequence, bids, asks)
    }

    /// Create a diff message.
    pub fn diff(
        trading_pair: impl Into<String>,
        sequence: u64,
        bids: Vec<BookEntry>,
        asks: Vec<BookEntry>,
    ) -> Self {
        Self::book(MessageKind::Diff, trading_pair, sequence, bids, asks)
    }

    /// Create a trade message.
    pub fn trade(trading_pair: impl Into<String>, sequence: u64, trade: TradeInfo) -> Self {
        Self {
            kind: MessageKind::Trade,
            trading_pair: trading_pair.into(),
            sequence,
            bids: Vec::new(),
            asks: Vec::new(),
            trade: Some(trade),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn book(
        kind: MessageKind,
        trading_pair: impl Into<String>,
        sequence: u64,
        bids: Vec<BookEntry>,
        asks: Vec<BookEntry>,
    ) -> Self {
        Self {
            kind,
            trading_pair: trading_pair.into(),
            sequence,
            bids,
            asks,
            trade: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Override the receipt timestamp.
    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Milliseconds between receipt and now, clamped at zero.
    pub fn age_ms(&self) -> f64 {
        let age = OffsetDateTime::now_utc() - self.timestamp;
        (age.as_seconds_f64() * 1000.0).max(0.0)
    }

    /// Check field-level sanity before the message reaches a book.
    pub fn validate(&self, feed_kind: FeedKind) -> Result<(), MessageError> {
        let malformed = |reason: String| MessageError::Malformed {
            trading_pair: self.trading_pair.clone(),
            reason,
        };

        if self.trading_pair.is_empty() {
            return Err(malformed("empty trading pair".to_string()));
        }

        if self.kind == MessageKind::Trade {
            let trade = self
                .trade
                .as_ref()
                .ok_or_else(|| malformed("trade message without trade details".to_string()))?;
            if trade.price <= Decimal::ZERO || trade.size <= Decimal::ZERO {
                return Err(malformed(format!(
                    "trade price {} / size {} must be positive",
                    trade.price, trade.size
                )));
            }
            return Ok(());
        }

        for entry in self.bids.iter().chain(&self.asks) {
            if entry.size < Decimal::ZERO {
                return Err(malformed(format!(
                    "negative size {} at price {}",
                    entry.size, entry.price
                )));
            }
            // Per-order deletes may carry a zero price; the tracked price is used.
            let zero_price_delete = feed_kind == FeedKind::PerOrder && entry.size.is_zero();
            if entry.price <= Decimal::ZERO && !zero_price_delete {
                return Err(malformed(format!("non-positive price {}", entry.price)));
            }
            if feed_kind == FeedKind::PerOrder
                && self.kind == MessageKind::Diff
                && entry.order_id.is_none()
            {
                return Err(malformed(format!(
                    "per-order diff entry at {} has no order id",
                    entry.price
                )));
            }
        }

        Ok(())
    }
}
