//! Feed boundary: normalized messages, routing and adapters.

pub mod message;
pub mod rest;
pub mod router;
pub mod source;
pub mod websocket;

pub use message::{FeedKind, MessageKind, NormalizedMessage, TradeInfo};
pub use rest::RestSnapshotSource;
pub use router::{FeedRouter, PairSender, RouteOutcome, RouterConfig};
pub use source::{
    BackoffConfig, FeedEvent, MockConfig, MockSnapshotSource, SnapshotBuilder, SnapshotSource,
};
pub use websocket::NormalizedWsFeed;
