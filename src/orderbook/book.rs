//! Per-pair price-level ledger.
//!
//! The book is keyed by exact decimal price: two entries quoting the same
//! price aggregate into one level instead of duplicating. Sequencing is
//! enforced here, not by callers: a diff at or below `snapshot_uid` is a no-op.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::debug;

use super::types::{BookEntry, Depth, OrderBookView, PriceLevel, ReconcilerState};
use crate::error::BookError;

/// L2 order book for one trading pair.
#[derive(Debug, Clone)]
pub struct OrderBook {
    trading_pair: String,
    /// Bid levels: price -> size, iterated in reverse for best-first.
    bids: BTreeMap<Decimal, Decimal>,
    /// Ask levels: price -> size.
    asks: BTreeMap<Decimal, Decimal>,
    snapshot_uid: u64,
    last_diff_uid: u64,
    stale_diffs_dropped: u64,
    updated_at: OffsetDateTime,
}

impl OrderBook {
    /// Create an empty book.
    pub fn new(trading_pair: impl Into<String>) -> Self {
        Self {
            trading_pair: trading_pair.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            snapshot_uid: 0,
            last_diff_uid: 0,
            stale_diffs_dropped: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Trading pair this book belongs to.
    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    /// Last applied sequence.
    pub fn snapshot_uid(&self) -> u64 {
        self.snapshot_uid
    }

    /// Sequence of the last applied diff.
    pub fn last_diff_uid(&self) -> u64 {
        self.last_diff_uid
    }

    /// Number of diffs rejected as stale.
    pub fn stale_diffs_dropped(&self) -> u64 {
        self.stale_diffs_dropped
    }

    /// When the book was last mutated.
    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    /// Replace the whole book with a snapshot.
    ///
    /// Always succeeds: a snapshot is authoritative and becomes the new
    /// staleness floor. Entries quoting the same price are summed; entries
    /// with non-positive size are not stored.
    pub fn apply_snapshot(&mut self, bids: &[BookEntry], asks: &[BookEntry], sequence: u64) {
        self.bids = collect_levels(bids);
        self.asks = collect_levels(asks);
        self.snapshot_uid = sequence;
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Apply an incremental update.
    ///
    /// Returns `Ok(false)` without touching the book if `sequence` is not newer
    /// than `snapshot_uid`. A negative size is an invariant violation and is
    /// detected before any level is mutated.
    pub fn apply_diffs(
        &mut self,
        bids: &[BookEntry],
        asks: &[BookEntry],
        sequence: u64,
    ) -> Result<bool, BookError> {
        if sequence <= self.snapshot_uid {
            self.stale_diffs_dropped += 1;
            debug!(
                trading_pair = %self.trading_pair,
                sequence,
                snapshot_uid = self.snapshot_uid,
                "Dropping stale diff"
            );
            return Ok(false);
        }

        if let Some(entry) = bids.iter().chain(asks).find(|e| e.size < Decimal::ZERO) {
            return Err(BookError::NegativeSize {
                trading_pair: self.trading_pair.clone(),
                price: entry.price,
                size: entry.size,
            });
        }

        apply_levels(&mut self.bids, bids);
        apply_levels(&mut self.asks, asks);

        self.snapshot_uid = sequence;
        self.last_diff_uid = sequence;
        self.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    /// Get the highest bid, `None` when there is no liquidity.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(&price, &size)| PriceLevel::new(price, size))
    }

    /// Get the lowest ask, `None` when there is no liquidity.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(&price, &size)| PriceLevel::new(price, size))
    }

    /// Up to `n` levels per side in best-first order.
    pub fn depth(&self, n: usize) -> Depth {
        Depth {
            bids: self.bid_levels().take(n).collect(),
            asks: self.ask_levels().take(n).collect(),
        }
    }

    /// Size resting at `price` on the bid side.
    pub fn bid_size_at(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&price).copied()
    }

    /// Size resting at `price` on the ask side.
    pub fn ask_size_at(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    /// Number of bid and ask levels.
    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Whether both sides are empty.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Drop all levels and reset sequencing.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.snapshot_uid = 0;
        self.last_diff_uid = 0;
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Copy the book out for readers.
    pub fn view(&self, state: ReconcilerState) -> OrderBookView {
        OrderBookView {
            trading_pair: self.trading_pair.clone(),
            state,
            bids: self.bid_levels().collect(),
            asks: self.ask_levels().collect(),
            snapshot_uid: self.snapshot_uid,
            last_diff_uid: self.last_diff_uid,
            stale_diffs_dropped: self.stale_diffs_dropped,
            updated_at: self.updated_at,
        }
    }

    fn bid_levels(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids
            .iter()
            .rev()
            .map(|(&price, &size)| PriceLevel::new(price, size))
    }

    fn ask_levels(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks
            .iter()
            .map(|(&price, &size)| PriceLevel::new(price, size))
    }
}

fn collect_levels(entries: &[BookEntry]) -> BTreeMap<Decimal, Decimal> {
    let mut levels = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.size > Decimal::ZERO) {
        *levels.entry(entry.price).or_insert(Decimal::ZERO) += entry.size;
    }
    levels
}

fn apply_levels(levels: &mut BTreeMap<Decimal, Decimal>, entries: &[BookEntry]) {
    for entry in entries {
        if entry.size.is_zero() {
            levels.remove(&entry.price);
        } else {
            levels.insert(entry.price, entry.size);
        }
    }
}
