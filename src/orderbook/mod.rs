//! Order book module for per-pair market state.
//!
//! This module handles:
//! - Order book types and the read-only view handed to callers
//! - The price-level ledger with sequence gating
//! - Per-order to per-level translation for order-by-order feeds

pub mod active_orders;
pub mod book;
pub mod types;

pub use active_orders::{ActiveOrderTracker, LevelDelta, TrackedOrder};
pub use book::OrderBook;
pub use types::{BookEntry, Depth, OrderBookView, PriceLevel, ReconcilerState, Side};
