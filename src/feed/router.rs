//! Fan-out of feed messages to per-pair reconciler queues.
//!
//! Messages for pairs that have no registered queue yet are held in a
//! bounded per-pair orphan buffer and handed over, in arrival order, when
//! the pair registers. Routing never blocks: a full queue drops the message
//! and asks for a resnapshot instead.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::message::NormalizedMessage;
use crate::error::RouteError;
use crate::metrics;

/// Sending half of a pair's reconciler queue.
pub type PairSender = mpsc::Sender<NormalizedMessage>;

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Enqueued on the pair's reconciler queue.
    Delivered,
    /// Held in the orphan buffer; `dropped` oldest entries were evicted.
    Orphaned {
        /// Messages evicted to make room.
        dropped: usize,
    },
    /// Pair queue was full; the message was dropped.
    QueueFull,
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum orphan-buffered messages per pair.
    pub orphan_buffer_capacity: usize,
    /// Queue fill fraction that triggers a warning.
    pub high_water_mark: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            orphan_buffer_capacity: 256,
            high_water_mark: 0.8,
        }
    }
}

#[derive(Debug)]
struct PairRoute {
    sender: PairSender,
    above_high_water: bool,
}

#[derive(Debug, Default)]
struct RouterInner {
    routes: HashMap<String, PairRoute>,
    orphans: HashMap<String, VecDeque<NormalizedMessage>>,
}

/// Dispatches normalized messages to the queue of the owning pair.
#[derive(Debug)]
pub struct FeedRouter {
    inner: Mutex<RouterInner>,
    config: RouterConfig,
    resync_tx: Option<mpsc::UnboundedSender<String>>,
}

impl FeedRouter {
    /// Create a router without a resync channel.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
            config,
            resync_tx: None,
        }
    }

    /// Create a router that reports pairs needing a fresh snapshot on `resync_tx`.
    pub fn with_resync(config: RouterConfig, resync_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            resync_tx: Some(resync_tx),
            ..Self::new(config)
        }
    }

    /// Route one message to its pair's queue, or orphan-buffer it.
    pub fn route(&self, message: NormalizedMessage) -> RouteOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pair = message.trading_pair.clone();

        let undelivered = match inner.routes.get_mut(&pair) {
            None => message,
            Some(route) => match route.sender.try_send(message) {
                Ok(()) => {
                    metrics::inc_messages_routed();
                    self.track_high_water(&pair, route);
                    return RouteOutcome::Delivered;
                }
                Err(TrySendError::Full(_)) => {
                    let err = RouteError::QueueFull {
                        trading_pair: pair.clone(),
                        capacity: route.sender.max_capacity(),
                    };
                    warn!(error = %err, "Dropping message, requesting resnapshot");
                    metrics::inc_queue_overflow(&pair);
                    self.request_resync(&pair);
                    return RouteOutcome::QueueFull;
                }
                Err(TrySendError::Closed(message)) => {
                    debug!(trading_pair = %pair, "Queue closed, buffering until re-registration");
                    inner.routes.remove(&pair);
                    message
                }
            },
        };

        self.buffer_orphan(inner, pair, undelivered)
    }

    /// Install `sender` as the queue for `trading_pair`.
    ///
    /// Orphan-buffered messages are moved onto the queue first, in arrival
    /// order, under the same lock that `route` takes, so no live message can
    /// overtake the backlog. Returns how many messages were handed over.
    pub fn register(&self, trading_pair: &str, sender: PairSender) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut drained = 0;

        if let Some(backlog) = inner.orphans.remove(trading_pair) {
            let total = backlog.len();
            for message in backlog {
                match sender.try_send(message) {
                    Ok(()) => drained += 1,
                    Err(TrySendError::Full(_)) => {
                        let lost = total - drained;
                        warn!(
                            trading_pair,
                            lost,
                            "Queue too small for orphan backlog, requesting resnapshot"
                        );
                        metrics::inc_queue_overflow(trading_pair);
                        self.request_resync(trading_pair);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }

        inner.routes.insert(
            trading_pair.to_string(),
            PairRoute {
                sender,
                above_high_water: false,
            },
        );
        info!(trading_pair, drained, "Registered pair with router");
        drained
    }

    /// Stop routing to `trading_pair` and discard its orphan buffer.
    ///
    /// Returns whether the pair had a route.
    pub fn unregister(&self, trading_pair: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.orphans.remove(trading_pair);
        let removed = inner.routes.remove(trading_pair).is_some();
        if removed {
            info!(trading_pair, "Unregistered pair from router");
        }
        removed
    }

    /// Whether `trading_pair` currently has a route.
    pub fn is_registered(&self, trading_pair: &str) -> bool {
        self.inner.lock().routes.contains_key(trading_pair)
    }

    /// Pairs with a route, sorted.
    pub fn registered_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.inner.lock().routes.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Number of orphan-buffered messages for `trading_pair`.
    pub fn orphan_len(&self, trading_pair: &str) -> usize {
        self.inner
            .lock()
            .orphans
            .get(trading_pair)
            .map_or(0, VecDeque::len)
    }

    /// Drop every route and orphan buffer.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.routes.clear();
        inner.orphans.clear();
    }

    fn buffer_orphan(
        &self,
        inner: &mut RouterInner,
        pair: String,
        message: NormalizedMessage,
    ) -> RouteOutcome {
        let capacity = self.config.orphan_buffer_capacity;
        let buffer = inner.orphans.entry(pair.clone()).or_default();
        buffer.push_back(message);
        metrics::inc_messages_orphaned();

        let mut dropped = 0;
        while buffer.len() > capacity {
            buffer.pop_front();
            dropped += 1;
        }

        if dropped > 0 {
            let err = RouteError::OrphanOverflow {
                trading_pair: pair.clone(),
                dropped,
            };
            warn!(error = %err, capacity, "Orphan buffer overflow");
            metrics::inc_orphan_overflow(&pair, dropped as u64);
        }

        RouteOutcome::Orphaned { dropped }
    }

    fn track_high_water(&self, pair: &str, route: &mut PairRoute) {
        let max = route.sender.max_capacity();
        let used = max - route.sender.capacity();
        let mark = ((max as f64) * self.config.high_water_mark).ceil() as usize;

        if used >= mark {
            if !route.above_high_water {
                route.above_high_water = true;
                warn!(trading_pair = %pair, used, max, "Pair queue above high-water mark");
            }
        } else {
            route.above_high_water = false;
        }
    }

    fn request_resync(&self, pair: &str) {
        if let Some(tx) = &self.resync_tx {
            let _ = tx.send(pair.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::types::BookEntry;
    use rust_decimal_macros::dec;

    fn diff(pair: &str, sequence: u64) -> NormalizedMessage {
        NormalizedMessage::diff(
            pair,
            sequence,
            vec![BookEntry::level(dec!(10), dec!(1))],
            vec![],
        )
    }

    fn router(orphan_capacity: usize) -> FeedRouter {
        FeedRouter::new(RouterConfig {
            orphan_buffer_capacity: orphan_capacity,
            high_water_mark: 0.8,
        })
    }

    #[test]
    fn routes_to_registered_pair() {
        let router = router(8);
        let (tx, mut rx) = mpsc::channel(8);
        router.register("BTC-USDT", tx);

        assert_eq!(router.route(diff("BTC-USDT", 1)), RouteOutcome::Delivered);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
    }

    #[test]
    fn orphans_are_delivered_in_order_on_register() {
        let router = router(8);
        for seq in [3, 1, 2] {
            assert_eq!(
                router.route(diff("X-Y", seq)),
                RouteOutcome::Orphaned { dropped: 0 }
            );
        }
        assert_eq!(router.orphan_len("X-Y"), 3);

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(router.register("X-Y", tx), 3);
        router.route(diff("X-Y", 4));

        let received: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.sequence)
            .collect();
        assert_eq!(received, vec![3, 1, 2, 4]);
        assert_eq!(router.orphan_len("X-Y"), 0);
    }

    #[test]
    fn orphan_overflow_drops_oldest() {
        let router = router(2);
        router.route(diff("X-Y", 1));
        router.route(diff("X-Y", 2));
        assert_eq!(
            router.route(diff("X-Y", 3)),
            RouteOutcome::Orphaned { dropped: 1 }
        );

        let (tx, mut rx) = mpsc::channel(8);
        router.register("X-Y", tx);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
        assert_eq!(rx.try_recv().unwrap().sequence, 3);
    }

    #[test]
    fn full_queue_drops_and_requests_resync() {
        let (resync_tx, mut resync_rx) = mpsc::unbounded_channel();
        let router = FeedRouter::with_resync(RouterConfig::default(), resync_tx);
        let (tx, _rx) = mpsc::channel(1);
        router.register("BTC-USDT", tx);

        assert_eq!(router.route(diff("BTC-USDT", 1)), RouteOutcome::Delivered);
        assert_eq!(router.route(diff("BTC-USDT", 2)), RouteOutcome::QueueFull);
        assert_eq!(resync_rx.try_recv().unwrap(), "BTC-USDT");
    }

    #[test]
    fn closed_queue_falls_back_to_orphan_buffer() {
        let router = router(8);
        let (tx, rx) = mpsc::channel(8);
        router.register("BTC-USDT", tx);
        drop(rx);

        assert_eq!(
            router.route(diff("BTC-USDT", 1)),
            RouteOutcome::Orphaned { dropped: 0 }
        );
        assert!(!router.is_registered("BTC-USDT"));

        let (tx, mut rx) = mpsc::channel(8);
        router.register("BTC-USDT", tx);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
    }

    #[test]
    fn unregister_discards_orphans() {
        let router = router(8);
        let (tx, _rx) = mpsc::channel(8);
        router.register("A-B", tx);
        router.route(diff("C-D", 1));

        assert!(router.unregister("A-B"));
        assert!(!router.unregister("C-D"));
        assert_eq!(router.orphan_len("C-D"), 0);
        assert!(router.registered_pairs().is_empty());
    }
}
