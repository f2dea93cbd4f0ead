//! HTTP API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::feed::message::FeedKind;
use crate::orderbook::types::{PriceLevel, ReconcilerState};
use crate::tracker::Tracker;

/// Default number of levels returned per side.
const DEFAULT_DEPTH: usize = 20;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Tracker whose books are served.
    pub tracker: Arc<Tracker>,
    /// Prometheus handle, when a recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            tracker,
            prometheus: None,
        }
    }

    /// Serve metrics from `handle` on `/metrics`.
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Check if every tracked book is live.
    pub fn is_ready(&self) -> bool {
        self.tracker.ready()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Pairs being tracked.
    pub pairs: usize,
    /// Pairs with a live book.
    pub live: usize,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Feed kind being reconciled.
    pub feed_kind: FeedKind,
    /// Per-pair summary.
    pub pairs: Vec<PairStatus>,
}

/// One pair in the status response.
#[derive(Debug, Serialize)]
pub struct PairStatus {
    /// Trading pair.
    pub trading_pair: String,
    /// Reconciler state.
    pub state: ReconcilerState,
    /// Last applied sequence.
    pub snapshot_uid: u64,
    /// Diffs dropped as stale.
    pub stale_diffs_dropped: u64,
    /// Best bid price.
    pub best_bid: Option<String>,
    /// Best ask price.
    pub best_ask: Option<String>,
}

/// Query parameters for the book endpoint.
#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    /// Levels per side.
    pub depth: Option<usize>,
}

/// Book response.
#[derive(Debug, Serialize)]
pub struct BookResponse {
    /// Trading pair.
    pub trading_pair: String,
    /// Reconciler state.
    pub state: ReconcilerState,
    /// Last applied sequence.
    pub snapshot_uid: u64,
    /// Best ask minus best bid.
    pub spread: Option<String>,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if every book is live, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let pairs = state.tracker.trading_pairs();
    let live = pairs
        .iter()
        .filter(|p| state.tracker.state(p) == Some(ReconcilerState::Live))
        .count();
    let is_ready = state.is_ready();

    let response = ReadyResponse {
        ready: is_ready,
        pairs: pairs.len(),
        live,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - returns per-pair book summaries.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let tracker = &state.tracker;
    let pairs = tracker
        .trading_pairs()
        .into_iter()
        .filter_map(|pair| tracker.order_book(&pair))
        .map(|view| PairStatus {
            best_bid: view.best_bid().map(|l| l.price.to_string()),
            best_ask: view.best_ask().map(|l| l.price.to_string()),
            trading_pair: view.trading_pair,
            state: view.state,
            snapshot_uid: view.snapshot_uid,
            stale_diffs_dropped: view.stale_diffs_dropped,
        })
        .collect();

    let status = if !tracker.is_running() {
        "stopped"
    } else if tracker.ready() {
        "running"
    } else {
        "starting"
    };

    Json(StatusResponse {
        status,
        feed_kind: tracker.feed_kind(),
        pairs,
    })
}

/// Book handler - returns up to `depth` levels per side.
pub async fn book(
    State(state): State<AppState>,
    Path(pair): Path<String>,
    Query(query): Query<DepthQuery>,
) -> impl IntoResponse {
    let Some(view) = state.tracker.order_book(&pair) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("trading pair {pair} is not tracked"),
            }),
        )
            .into_response();
    };

    let depth = view.depth(query.depth.unwrap_or(DEFAULT_DEPTH));
    Json(BookResponse {
        spread: view.spread().map(|s| s.to_string()),
        trading_pair: view.trading_pair,
        state: view.state,
        snapshot_uid: view.snapshot_uid,
        bids: depth.bids,
        asks: depth.asks,
    })
    .into_response()
}

/// Metrics handler - Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}
