//! Per-order to per-level translation for feeds that report individual orders.
//!
//! The tracker keeps every resting order by id and a running aggregate per
//! price level, and turns each order event into the level deltas that
//! [`OrderBook::apply_diffs`](super::book::OrderBook::apply_diffs) consumes.
//! It has no say over sequencing; stale events must be filtered before they
//! reach it.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use smallvec::SmallVec;
use tracing::warn;

use super::types::{BookEntry, PriceLevel, Side};

/// A resting order as last reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedOrder {
    /// Order price.
    pub price: Decimal,
    /// Remaining size.
    pub size: Decimal,
    /// Book side.
    pub side: Side,
}

/// New aggregate size at one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDelta {
    /// Book side.
    pub side: Side,
    /// Level price.
    pub price: Decimal,
    /// Aggregate size after the event; zero removes the level.
    pub size: Decimal,
}

impl LevelDelta {
    fn into_entry(self) -> BookEntry {
        BookEntry::level(self.price, self.size)
    }
}

/// An order move touches at most two levels.
pub type LevelDeltas = SmallVec<[LevelDelta; 2]>;

/// Tracks active orders by id for one trading pair.
#[derive(Debug, Clone, Default)]
pub struct ActiveOrderTracker {
    orders_by_id: HashMap<String, TrackedOrder>,
    bid_levels: BTreeMap<Decimal, Decimal>,
    ask_levels: BTreeMap<Decimal, Decimal>,
}

impl ActiveOrderTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked orders.
    pub fn len(&self) -> usize {
        self.orders_by_id.len()
    }

    /// Whether no orders are tracked.
    pub fn is_empty(&self) -> bool {
        self.orders_by_id.is_empty()
    }

    /// Look up a tracked order.
    pub fn get(&self, order_id: &str) -> Option<&TrackedOrder> {
        self.orders_by_id.get(order_id)
    }

    /// Forget every order.
    pub fn clear(&mut self) {
        self.orders_by_id.clear();
        self.bid_levels.clear();
        self.ask_levels.clear();
    }

    /// Aggregate size at `price` on `side`, zero when nothing rests there.
    pub fn level_size(&self, side: Side, price: Decimal) -> Decimal {
        self.levels(side)
            .get(&price)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Aggregated levels for `side`, best first.
    pub fn aggregate(&self, side: Side) -> Vec<PriceLevel> {
        let levels = self.levels(side).iter().map(|(&p, &s)| PriceLevel::new(p, s));
        match side {
            Side::Bid => levels.rev().collect(),
            Side::Ask => levels.collect(),
        }
    }

    /// Apply one order event and return the affected level aggregates.
    ///
    /// A zero size removes the order; the delta is emitted at the price the
    /// order was tracked at, falling back to the event price for unknown ids.
    /// A non-zero size upserts the order; if it moved price or side, the old
    /// level is emitted as well.
    pub fn apply_order_event(
        &mut self,
        order_id: &str,
        price: Decimal,
        size: Decimal,
        side: Side,
    ) -> LevelDeltas {
        let mut deltas = LevelDeltas::new();

        if size.is_zero() {
            match self.orders_by_id.remove(order_id) {
                Some(old) => {
                    self.adjust(old.side, old.price, -old.size);
                    deltas.push(self.delta(old.side, old.price));
                }
                None => deltas.push(self.delta(side, price)),
            }
            return deltas;
        }

        let new = TrackedOrder { price, size, side };
        if let Some(old) = self.orders_by_id.insert(order_id.to_string(), new) {
            self.adjust(old.side, old.price, -old.size);
            if old.side != side || old.price != price {
                deltas.push(self.delta(old.side, old.price));
            }
        }
        self.adjust(side, price, size);
        deltas.push(self.delta(side, price));
        deltas
    }

    /// Translate a per-order diff into aggregate level entries per side.
    ///
    /// Entries without an order id cannot be attributed to an order and are
    /// skipped, so the aggregates and the book never diverge.
    pub fn apply_diff_entries(
        &mut self,
        bids: &[BookEntry],
        asks: &[BookEntry],
    ) -> (Vec<BookEntry>, Vec<BookEntry>) {
        let mut out_bids = Vec::with_capacity(bids.len());
        let mut out_asks = Vec::with_capacity(asks.len());

        let sided = bids
            .iter()
            .map(|e| (Side::Bid, e))
            .chain(asks.iter().map(|e| (Side::Ask, e)));

        for (side, entry) in sided {
            let Some(id) = &entry.order_id else {
                warn!(price = %entry.price, %side, "Skipping per-order entry without order id");
                continue;
            };
            for delta in self.apply_order_event(id, entry.price, entry.size, side) {
                match delta.side {
                    Side::Bid => out_bids.push(delta.into_entry()),
                    Side::Ask => out_asks.push(delta.into_entry()),
                }
            }
        }

        (out_bids, out_asks)
    }

    /// Reset from a snapshot and return the aggregated levels to seed the book.
    ///
    /// When the snapshot is price-level only (any entry without an order id),
    /// the tracker is cleared and the entries are returned unchanged.
    pub fn rebuild_from_snapshot(
        &mut self,
        bids: &[BookEntry],
        asks: &[BookEntry],
    ) -> (Vec<BookEntry>, Vec<BookEntry>) {
        self.clear();

        let per_order = bids.iter().chain(asks).all(|e| e.order_id.is_some());
        if !per_order {
            return (bids.to_vec(), asks.to_vec());
        }

        for (side, entries) in [(Side::Bid, bids), (Side::Ask, asks)] {
            for entry in entries.iter().filter(|e| e.size > Decimal::ZERO) {
                if let Some(id) = &entry.order_id {
                    self.apply_order_event(id, entry.price, entry.size, side);
                }
            }
        }

        let to_entries = |levels: &BTreeMap<Decimal, Decimal>| -> Vec<BookEntry> {
            levels
                .iter()
                .map(|(&price, &size)| BookEntry::level(price, size))
                .collect()
        };
        (to_entries(&self.bid_levels), to_entries(&self.ask_levels))
    }

    fn levels(&self, side: Side) -> &BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &self.bid_levels,
            Side::Ask => &self.ask_levels,
        }
    }

    fn adjust(&mut self, side: Side, price: Decimal, by: Decimal) {
        let levels = match side {
            Side::Bid => &mut self.bid_levels,
            Side::Ask => &mut self.ask_levels,
        };
        let total = levels.entry(price).or_insert(Decimal::ZERO);
        *total += by;
        if *total <= Decimal::ZERO {
            levels.remove(&price);
        }
    }

    fn delta(&self, side: Side, price: Decimal) -> LevelDelta {
        LevelDelta {
            side,
            price,
            size: self.level_size(side, price),
        }
    }
}
