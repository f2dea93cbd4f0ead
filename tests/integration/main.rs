//! End-to-end tests driving the tracker through its public API.
//!
//! Feeds are plain channels and snapshots come from the mock source, so
//! these run without any network access.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use orderbook_tracker::feed::{
    BackoffConfig, FeedEvent, FeedKind, MockSnapshotSource, NormalizedMessage, SnapshotBuilder,
};
use orderbook_tracker::orderbook::{BookEntry, PriceLevel, ReconcilerState};
use orderbook_tracker::tracker::{Tracker, TrackerConfig};

const PAIR: &str = "BTC-USDT";

fn test_config() -> TrackerConfig {
    TrackerConfig {
        restart_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(500),
        snapshot_backoff: BackoffConfig {
            initial_delay_ms: 5,
            max_delay_s: 1,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn setup(
    config: TrackerConfig,
    source: MockSnapshotSource,
    feed_kind: FeedKind,
) -> (Tracker, mpsc::Sender<FeedEvent>) {
    let tracker = Tracker::new(config, Arc::new(source), feed_kind);
    let (tx, rx) = mpsc::channel(256);
    tracker.add_feed(rx);
    (tracker, tx)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn lvl(price: rust_decimal::Decimal, size: rust_decimal::Decimal) -> BookEntry {
    BookEntry::level(price, size)
}

async fn send(feed: &mpsc::Sender<FeedEvent>, message: NormalizedMessage) {
    feed.send(FeedEvent::Message(message)).await.unwrap();
}

#[tokio::test]
async fn snapshot_then_diffs_end_to_end() {
    let source = MockSnapshotSource::new();
    source.set_snapshot(
        SnapshotBuilder::new(PAIR, 100)
            .bid(dec!(10), dec!(5))
            .ask(dec!(11), dec!(3))
            .build(),
    );
    let (tracker, feed) = setup(test_config(), source, FeedKind::AggregateLevels);
    tracker.start([PAIR]).unwrap();

    eventually("snapshot", || tracker.ready()).await;
    let view = tracker.order_book(PAIR).unwrap();
    assert_eq!(view.best_bid().map(|l| l.price), Some(dec!(10)));
    assert_eq!(view.best_ask().map(|l| l.price), Some(dec!(11)));

    send(&feed, NormalizedMessage::diff(PAIR, 101, vec![lvl(dec!(10), dec!(0))], vec![])).await;
    eventually("diff 101", || {
        tracker.order_book(PAIR).map(|v| v.snapshot_uid) == Some(101)
    })
    .await;
    assert_eq!(tracker.order_book(PAIR).unwrap().best_bid(), None);

    send(&feed, NormalizedMessage::diff(PAIR, 102, vec![lvl(dec!(9), dec!(2))], vec![])).await;
    eventually("diff 102", || {
        tracker.order_book(PAIR).map(|v| v.snapshot_uid) == Some(102)
    })
    .await;
    assert_eq!(
        tracker.order_book(PAIR).unwrap().best_bid(),
        Some(PriceLevel::new(dec!(9), dec!(2)))
    );

    send(&feed, NormalizedMessage::diff(PAIR, 90, vec![], vec![lvl(dec!(11), dec!(0))])).await;
    eventually("stale diff counted", || {
        tracker.order_book(PAIR).map(|v| v.stale_diffs_dropped) == Some(1)
    })
    .await;
    let view = tracker.order_book(PAIR).unwrap();
    assert_eq!(view.best_ask(), Some(PriceLevel::new(dec!(11), dec!(3))));
    assert_eq!(view.snapshot_uid, 102);

    tracker.stop().await;
}

#[tokio::test]
async fn early_diffs_are_replayed_in_sequence_order() {
    let source = MockSnapshotSource::with_config(orderbook_tracker::feed::MockConfig {
        latency_ms: 100,
        ..Default::default()
    });
    source.set_snapshot(SnapshotBuilder::new(PAIR, 6).ask(dec!(20), dec!(1)).build());
    let (tracker, feed) = setup(test_config(), source, FeedKind::AggregateLevels);
    tracker.start([PAIR]).unwrap();

    for (seq, price) in [(5u64, dec!(5)), (7, dec!(7)), (6, dec!(6))] {
        send(&feed, NormalizedMessage::diff(PAIR, seq, vec![lvl(price, dec!(1))], vec![])).await;
    }
    assert_eq!(tracker.state(PAIR), Some(ReconcilerState::Unseeded));
    assert_eq!(tracker.order_book(PAIR).unwrap().best_bid(), None);

    eventually("live", || tracker.ready()).await;
    let view = tracker.order_book(PAIR).unwrap();
    assert_eq!(view.bids, vec![PriceLevel::new(dec!(7), dec!(1))]);
    assert_eq!(view.asks, vec![PriceLevel::new(dec!(20), dec!(1))]);
    assert_eq!(view.snapshot_uid, 7);

    tracker.stop().await;
}

#[tokio::test]
async fn orphaned_messages_keep_arrival_order() {
    let (tracker, feed) = setup(test_config(), MockSnapshotSource::new(), FeedKind::AggregateLevels);
    tracker.start([PAIR]).unwrap();

    // Arrival order 3, 1, 2 with one level each; the book ends up with all of them.
    for (seq, price) in [(3u64, dec!(3)), (1, dec!(1)), (2, dec!(2))] {
        send(&feed, NormalizedMessage::diff("ETH-USDT", seq, vec![lvl(price, dec!(1))], vec![])).await;
    }
    eventually("orphaned", || tracker.orphaned_messages("ETH-USDT") == 3).await;

    tracker.add_trading_pair("ETH-USDT").unwrap();
    eventually("eth live", || tracker.state("ETH-USDT") == Some(ReconcilerState::Live)).await;

    let view = tracker.order_book("ETH-USDT").unwrap();
    assert_eq!(view.snapshot_uid, 3);
    assert_eq!(view.bids.len(), 3);

    tracker.stop().await;
}

#[tokio::test]
async fn per_order_feed_tracks_aggregates() {
    let source = MockSnapshotSource::new();
    source.set_snapshot(NormalizedMessage::snapshot(
        PAIR,
        10,
        vec![
            BookEntry::order("a", dec!(10), dec!(1)),
            BookEntry::order("b", dec!(10), dec!(2)),
        ],
        vec![BookEntry::order("c", dec!(11), dec!(5))],
    ));
    let (tracker, feed) = setup(test_config(), source, FeedKind::PerOrder);
    tracker.start([PAIR]).unwrap();
    eventually("live", || tracker.ready()).await;

    assert_eq!(
        tracker.order_book(PAIR).unwrap().best_bid(),
        Some(PriceLevel::new(dec!(10), dec!(3)))
    );

    send(
        &feed,
        NormalizedMessage::diff(
            PAIR,
            11,
            vec![BookEntry::order("b", dec!(0), dec!(0))],
            vec![BookEntry::order("d", dec!(11), dec!(1))],
        ),
    )
    .await;
    eventually("diff 11", || {
        tracker.order_book(PAIR).map(|v| v.snapshot_uid) == Some(11)
    })
    .await;

    let view = tracker.order_book(PAIR).unwrap();
    assert_eq!(view.best_bid(), Some(PriceLevel::new(dec!(10), dec!(1))));
    assert_eq!(view.best_ask(), Some(PriceLevel::new(dec!(11), dec!(6))));

    tracker.stop().await;
}

#[tokio::test]
async fn malformed_messages_do_not_stop_the_pair() {
    let source = MockSnapshotSource::new();
    source.set_snapshot(SnapshotBuilder::new(PAIR, 1).bid(dec!(10), dec!(1)).build());
    let (tracker, feed) = setup(test_config(), source, FeedKind::AggregateLevels);
    tracker.start([PAIR]).unwrap();
    eventually("live", || tracker.ready()).await;

    send(&feed, NormalizedMessage::diff(PAIR, 2, vec![lvl(dec!(10), dec!(-1))], vec![])).await;
    send(&feed, NormalizedMessage::diff(PAIR, 3, vec![lvl(dec!(9), dec!(4))], vec![])).await;

    eventually("diff 3", || {
        tracker.order_book(PAIR).map(|v| v.snapshot_uid) == Some(3)
    })
    .await;
    let view = tracker.order_book(PAIR).unwrap();
    assert_eq!(view.best_bid(), Some(PriceLevel::new(dec!(10), dec!(1))));
    assert_eq!(view.bids.len(), 2);
    assert_eq!(tracker.state(PAIR), Some(ReconcilerState::Live));

    tracker.stop().await;
}

#[tokio::test]
async fn queue_overflow_triggers_resnapshot() {
    let source = MockSnapshotSource::new();
    source.set_snapshot(SnapshotBuilder::new(PAIR, 1).bid(dec!(10), dec!(1)).build());
    let source_handle = source.clone();
    let config = TrackerConfig {
        message_queue_capacity: 4,
        ..test_config()
    };
    let (tracker, feed) = setup(config, source, FeedKind::AggregateLevels);
    tracker.start([PAIR]).unwrap();
    eventually("live", || tracker.ready()).await;

    source_handle.set_snapshot(SnapshotBuilder::new(PAIR, 500).bid(dec!(42), dec!(1)).build());
    // Queue the burst without yielding so the router sees it all at once.
    for seq in 2..50u64 {
        feed.try_send(FeedEvent::Message(NormalizedMessage::diff(
            PAIR,
            seq,
            vec![lvl(dec!(9), rust_decimal::Decimal::from(seq))],
            vec![],
        )))
        .unwrap();
    }

    eventually("resnapshot", || {
        tracker.order_book(PAIR).map(|v| v.snapshot_uid) == Some(500)
    })
    .await;
    assert!(source_handle.fetch_count(PAIR) >= 2);
    assert_eq!(
        tracker.order_book(PAIR).unwrap().best_bid(),
        Some(PriceLevel::new(dec!(42), dec!(1)))
    );

    tracker.stop().await;
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let (tracker, _feed) = setup(test_config(), MockSnapshotSource::new(), FeedKind::AggregateLevels);
    tracker.start([PAIR, "ETH-USDT"]).unwrap();
    eventually("live", || tracker.ready()).await;

    tracker.stop().await;
    tracker.stop().await;

    assert!(tracker.order_book(PAIR).is_none());
    assert!(tracker.trading_pairs().is_empty());
}
