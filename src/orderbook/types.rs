//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Book side.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Side {
    /// Bid side (buy orders).
    #[strum(to_string = "bid", serialize = "buy")]
    Bid,
    /// Ask side (sell orders).
    #[strum(to_string = "ask", serialize = "sell")]
    Ask,
}

impl Side {
    /// Get the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// One bid/ask entry carried by a feed message.
///
/// `order_id` is only set by per-order feeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookEntry {
    /// Price of the level or order.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Size; zero in a diff means "remove".
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Exchange order id, for per-order feeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl BookEntry {
    /// Create an aggregate price-level entry.
    pub fn level(price: Decimal, size: Decimal) -> Self {
        Self {
            price,
            size,
            order_id: None,
        }
    }

    /// Create a per-order entry.
    pub fn order(order_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            price,
            size,
            order_id: Some(order_id.into()),
        }
    }
}

/// Lifecycle state of a pair's reconciler, as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReconcilerState {
    /// No snapshot applied yet.
    Unseeded,
    /// Snapshot applied, diffs applying normally.
    Live,
    /// Task cancelled.
    Stopped,
}

impl ReconcilerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ReconcilerState::Unseeded => 0,
            ReconcilerState::Live => 1,
            ReconcilerState::Stopped => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ReconcilerState::Live,
            2 => ReconcilerState::Stopped,
            _ => ReconcilerState::Unseeded,
        }
    }
}

/// Up to `n` levels per side, best first.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Depth {
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
}

/// Read-only copy of one pair's book, taken under a read lock.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookView {
    /// Trading pair this book represents.
    pub trading_pair: String,
    /// Reconciler state at the time of the read.
    pub state: ReconcilerState,
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// Last applied sequence.
    pub snapshot_uid: u64,
    /// Sequence of the last applied diff.
    pub last_diff_uid: u64,
    /// Diffs dropped as stale since the book was created.
    pub stale_diffs_dropped: u64,
    /// When the book was last mutated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OrderBookView {
    /// Whether a snapshot has been applied.
    pub fn is_seeded(&self) -> bool {
        self.state == ReconcilerState::Live
    }

    /// Get the best bid, `None` when there is no liquidity.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Get the best ask, `None` when there is no liquidity.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Up to `n` levels per side.
    pub fn depth(&self, n: usize) -> Depth {
        Depth {
            bids: self.bids.iter().take(n).copied().collect(),
            asks: self.asks.iter().take(n).copied().collect(),
        }
    }

    /// Check if the book is inverted (best_ask < best_bid).
    pub fn is_inverted(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask.price < bid.price,
            _ => false,
        }
    }

    /// Get total liquidity on the bid side.
    pub fn total_bid_liquidity(&self) -> Decimal {
        self.bids.iter().map(|l| l.size).sum()
    }

    /// Get total liquidity on the ask side.
    pub fn total_ask_liquidity(&self) -> Decimal {
        self.asks.iter().map(|l| l.size).sum()
    }
}
