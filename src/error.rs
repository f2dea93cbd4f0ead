//! Unified error types for the order book tracker.

use rust_decimal::Decimal;
use thiserror::Error;

/// Unified error type for the tracker binary and library entry points.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration validation error.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Feed adapter error.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// Tracker lifecycle error.
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recoverable data errors found while validating a feed message.
///
/// These never terminate a reconciler: the message is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Price, size, side or order id fields are unusable.
    #[error("malformed message for {trading_pair}: {reason}")]
    Malformed {
        /// Trading pair the message was addressed to.
        trading_pair: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Invariant violations inside the order book.
///
/// Raised distinctly from [`MessageError`]: reaching one of these means
/// validation was bypassed, so the owning reconciler is torn down and
/// restarted from an unseeded state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// A negative size reached `apply_diffs`.
    #[error("negative size {size} at price {price} reached {trading_pair} book")]
    NegativeSize {
        /// Trading pair of the book.
        trading_pair: String,
        /// Price of the offending level.
        price: Decimal,
        /// Offending size.
        size: Decimal,
    },
}

/// Feed router conditions surfaced to logs and metrics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Orphan buffer exceeded capacity before the pair registered.
    #[error("orphan buffer for {trading_pair} overflowed, dropped {dropped} oldest message(s)")]
    OrphanOverflow {
        /// Trading pair.
        trading_pair: String,
        /// Number of messages dropped.
        dropped: usize,
    },

    /// Per-pair queue was full, message dropped.
    #[error("queue for {trading_pair} is full (capacity {capacity})")]
    QueueFull {
        /// Trading pair.
        trading_pair: String,
        /// Queue capacity.
        capacity: usize,
    },
}

/// Feed adapter (push and pull) errors.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Connection failed.
    #[error("feed connection failed: {0}")]
    ConnectionFailed(String),

    /// Send failed.
    #[error("failed to send feed message: {0}")]
    SendFailed(String),

    /// Message parsing failed.
    #[error("failed to parse feed message: {0}")]
    ParseError(String),

    /// Snapshot fetch failed.
    #[error("failed to fetch snapshot for {trading_pair}: {reason}")]
    SnapshotFailed {
        /// Trading pair whose snapshot failed.
        trading_pair: String,
        /// Reason for failure.
        reason: String,
    },

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Tracker lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// `start` called twice without `stop`.
    #[error("tracker already started")]
    AlreadyStarted,

    /// Operation requires a running tracker.
    #[error("tracker is not running")]
    NotRunning,

    /// Trading pair is not tracked.
    #[error("trading pair {0} is not tracked")]
    UnknownPair(String),

    /// Trading pair is already tracked.
    #[error("trading pair {0} is already tracked")]
    DuplicatePair(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
