//! HTTP API route definitions.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{book, health, metrics, ready, status, AppState};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Book endpoints
        .route("/api/v1/status", get(status))
        .route("/api/v1/books/:pair", get(book))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use crate::feed::message::FeedKind;
    use crate::feed::source::{MockSnapshotSource, SnapshotBuilder};
    use crate::tracker::{Tracker, TrackerConfig};

    fn state_with(source: MockSnapshotSource) -> AppState {
        let tracker = Tracker::new(
            TrackerConfig::default(),
            Arc::new(source),
            FeedKind::AggregateLevels,
        );
        AppState::new(Arc::new(tracker))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn live_state() -> AppState {
        let source = MockSnapshotSource::new();
        source.set_snapshot(
            SnapshotBuilder::new("BTC-USDT", 100)
                .bid(dec!(10), dec!(5))
                .bid(dec!(9), dec!(1))
                .ask(dec!(11), dec!(3))
                .build(),
        );
        let state = state_with(source);
        state.tracker.start(["BTC-USDT"]).unwrap();
        for _ in 0..200 {
            if state.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.is_ready());
        state
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(state_with(MockSnapshotSource::new()));

        let (status, body) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_ready() {
        let app = create_router(state_with(MockSnapshotSource::new()));

        let (status, body) = get_json(app, "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_live() {
        let state = live_state().await;
        let app = create_router(state.clone());

        let (status, body) = get_json(app, "/ready").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["live"], 1);
        state.tracker.stop().await;
    }

    #[tokio::test]
    async fn book_endpoint_respects_depth() {
        let state = live_state().await;
        let app = create_router(state.clone());

        let (status, body) = get_json(app, "/api/v1/books/BTC-USDT?depth=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "live");
        assert_eq!(body["snapshot_uid"], 100);
        assert_eq!(body["bids"].as_array().unwrap().len(), 1);
        assert_eq!(body["bids"][0]["price"], "10");
        assert_eq!(body["spread"], "1");
        state.tracker.stop().await;
    }

    #[tokio::test]
    async fn book_endpoint_404_for_unknown_pair() {
        let app = create_router(state_with(MockSnapshotSource::new()));

        let (status, body) = get_json(app, "/api/v1/books/NOPE-USD").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("NOPE-USD"));
    }

    #[tokio::test]
    async fn status_lists_pairs() {
        let state = live_state().await;
        let app = create_router(state.clone());

        let (status, body) = get_json(app, "/api/v1/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["feed_kind"], "aggregate_levels");
        assert_eq!(body["pairs"][0]["trading_pair"], "BTC-USDT");
        assert_eq!(body["pairs"][0]["best_ask"], "11");
        state.tracker.stop().await;
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_unavailable() {
        let app = create_router(state_with(MockSnapshotSource::new()));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
