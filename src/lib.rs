//! Live order book tracking for many trading pairs.
//!
//! Exchange adapters hand the tracker normalized snapshot, diff and trade
//! messages. Each pair gets a reconciler that seeds its book from a
//! snapshot, replays diffs that arrived early, drops diffs that are older
//! than the book, and keeps the book live as new diffs stream in.
//!
//! ```text
//! feed ──► FeedRouter ──► [queue] ──► PairReconciler ──► OrderBook ◄── readers
//!              │ orphans                    │ trades
//!              └─ until pair registers      └──► broadcast
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`feed`]: Normalized messages, routing, WebSocket and REST adapters
//! - [`orderbook`]: Price-level books and per-order aggregation
//! - [`tracker`]: Per-pair reconcilers and their supervisor
//! - [`api`]: HTTP API for health, books and metrics
//! - [`metrics`]: Prometheus metric helpers
//! - [`utils`]: Shutdown helpers

pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod orderbook;
pub mod tracker;
pub mod utils;

pub use config::Config;
pub use error::{AppError, Result};
pub use feed::{FeedEvent, FeedKind, NormalizedMessage, SnapshotSource};
pub use orderbook::{OrderBook, OrderBookView, PriceLevel};
pub use tracker::{Tracker, TrackerConfig};
