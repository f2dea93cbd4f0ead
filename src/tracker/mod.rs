//! Order book tracker: one supervised reconciler per trading pair.
//!
//! The tracker wires feed receivers into a [`FeedRouter`], keeps a shared
//! book per pair, and fetches snapshots on start, on feed reconnect, on
//! queue overflow and (optionally) on a timer. Fetched snapshots are routed
//! like any other message so they stay in FIFO order with the pair's diffs.

pub mod reconciler;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FeedError, TrackerError};
use crate::feed::message::{FeedKind, NormalizedMessage};
use crate::feed::router::{FeedRouter, RouterConfig};
use crate::feed::source::{BackoffConfig, FeedEvent, SnapshotSource};
use crate::metrics;
use crate::orderbook::types::{OrderBookView, ReconcilerState};
use crate::utils::wait_for_shutdown;

pub use reconciler::{BookHandle, PairReconciler, PastDiffsWindow};

/// Tracker tuning.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Capacity of each pair's message queue.
    pub message_queue_capacity: usize,
    /// Orphan buffer and high-water settings.
    pub router: RouterConfig,
    /// Diffs kept while a pair waits for its first snapshot.
    pub past_diffs_window_size: usize,
    /// Capacity of the trade broadcast channel.
    pub trade_channel_capacity: usize,
    /// Periodic resnapshot interval; zero disables it.
    pub snapshot_refresh_interval: Duration,
    /// Pause before restarting a reconciler after a fatal error.
    pub restart_delay: Duration,
    /// How long `stop` waits for tasks before aborting them.
    pub shutdown_timeout: Duration,
    /// Retry schedule for snapshot fetches.
    pub snapshot_backoff: BackoffConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            message_queue_capacity: 1000,
            router: RouterConfig::default(),
            past_diffs_window_size: 512,
            trade_channel_capacity: 1024,
            snapshot_refresh_interval: Duration::ZERO,
            restart_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_millis(2000),
            snapshot_backoff: BackoffConfig::default(),
        }
    }
}

struct PairTask {
    handle: BookHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// State shared with every spawned task.
struct Shared {
    config: TrackerConfig,
    feed_kind: FeedKind,
    source: Arc<dyn SnapshotSource>,
    router: FeedRouter,
    trades: broadcast::Sender<NormalizedMessage>,
    pairs: RwLock<HashMap<String, PairTask>>,
    snapshots_in_flight: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    restarts: AtomicU64,
    #[cfg(test)]
    unchecked_messages: AtomicBool,
}

impl Shared {
    fn is_tracked(&self, trading_pair: &str) -> bool {
        self.pairs.read().contains_key(trading_pair)
    }

    fn pair_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pairs.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Tracks live order books for a set of trading pairs.
pub struct Tracker {
    shared: Arc<Shared>,
    resync_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pending_feeds: Mutex<Vec<mpsc::Receiver<FeedEvent>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    running: AtomicBool,
}

impl Tracker {
    /// Create a tracker. Nothing runs until [`Tracker::start`].
    pub fn new(
        config: TrackerConfig,
        snapshot_source: Arc<dyn SnapshotSource>,
        feed_kind: FeedKind,
    ) -> Self {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let (trades, _) = broadcast::channel(config.trade_channel_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let router = FeedRouter::with_resync(config.router.clone(), resync_tx);

        Self {
            shared: Arc::new(Shared {
                config,
                feed_kind,
                source: snapshot_source,
                router,
                trades,
                pairs: RwLock::new(HashMap::new()),
                snapshots_in_flight: Mutex::new(HashSet::new()),
                shutdown,
                restarts: AtomicU64::new(0),
                #[cfg(test)]
                unchecked_messages: AtomicBool::new(false),
            }),
            resync_rx: Mutex::new(Some(resync_rx)),
            pending_feeds: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Attach a push feed. Feeds added before `start` begin with it.
    pub fn add_feed(&self, feed: mpsc::Receiver<FeedEvent>) {
        if self.is_running() {
            let task = spawn_ingestion(&self.shared, feed);
            self.background.lock().push(task);
        } else {
            self.pending_feeds.lock().push(feed);
        }
    }

    /// Start tracking `trading_pairs`. A tracker starts at most once.
    #[instrument(skip_all)]
    pub fn start<I, S>(&self, trading_pairs: I) -> Result<(), TrackerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pairs: Vec<String> = trading_pairs.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        if let Some(dup) = pairs.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(TrackerError::DuplicatePair(dup.clone()));
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TrackerError::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);
        info!(pairs = pairs.len(), feed_kind = %self.shared.feed_kind, "Starting tracker");

        for pair in pairs {
            self.spawn_pair(pair);
        }

        let mut background = self.background.lock();
        for feed in self.pending_feeds.lock().drain(..) {
            background.push(spawn_ingestion(&self.shared, feed));
        }
        if let Some(resync_rx) = self.resync_rx.lock().take() {
            background.push(spawn_resync(&self.shared, resync_rx));
        }
        let interval = self.shared.config.snapshot_refresh_interval;
        if !interval.is_zero() {
            background.push(spawn_refresh(&self.shared, interval));
        }

        Ok(())
    }

    /// Begin tracking another pair while running.
    pub fn add_trading_pair(&self, trading_pair: impl Into<String>) -> Result<(), TrackerError> {
        if !self.is_running() {
            return Err(TrackerError::NotRunning);
        }
        let trading_pair = trading_pair.into();
        if self.shared.is_tracked(&trading_pair) {
            return Err(TrackerError::DuplicatePair(trading_pair));
        }
        self.spawn_pair(trading_pair);
        Ok(())
    }

    /// Stop tracking a pair and drop its book.
    pub async fn remove_trading_pair(&self, trading_pair: &str) -> Result<(), TrackerError> {
        let removed = self.shared.pairs.write().remove(trading_pair);
        let Some(pair_task) = removed else {
            return Err(TrackerError::UnknownPair(trading_pair.to_string()));
        };

        let _ = pair_task.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;
        join_or_abort(trading_pair, pair_task.task, deadline).await;
        self.shared.router.unregister(trading_pair);
        pair_task.handle.release();

        info!(trading_pair, "Stopped tracking pair");
        Ok(())
    }

    /// Stop every task and release all books. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Tracker not running, nothing to stop");
            return;
        }
        info!("Stopping tracker");

        self.shared.shutdown.send_replace(true);
        let pair_tasks: Vec<(String, PairTask)> = self.shared.pairs.write().drain().collect();
        for (_, pair_task) in &pair_tasks {
            let _ = pair_task.shutdown.send(true);
        }

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;
        let mut handles = Vec::with_capacity(pair_tasks.len());
        for (pair, pair_task) in pair_tasks {
            join_or_abort(&pair, pair_task.task, deadline).await;
            handles.push(pair_task.handle);
        }

        let background = std::mem::take(&mut *self.background.lock());
        for task in background {
            join_or_abort("background", task, deadline).await;
        }

        self.shared.router.clear();
        for handle in handles {
            handle.release();
        }
        info!("Tracker stopped");
    }

    /// Copy of a pair's book, `None` for untracked pairs.
    pub fn order_book(&self, trading_pair: &str) -> Option<OrderBookView> {
        let pairs = self.shared.pairs.read();
        pairs.get(trading_pair).map(|p| p.handle.view())
    }

    /// Lifecycle state of a pair's reconciler.
    pub fn state(&self, trading_pair: &str) -> Option<ReconcilerState> {
        let pairs = self.shared.pairs.read();
        pairs.get(trading_pair).map(|p| p.handle.state())
    }

    /// Tracked pairs, sorted.
    pub fn trading_pairs(&self) -> Vec<String> {
        self.shared.pair_names()
    }

    /// Whether every tracked pair is live. False when nothing is tracked.
    pub fn ready(&self) -> bool {
        let pairs = self.shared.pairs.read();
        !pairs.is_empty()
            && pairs
                .values()
                .all(|p| p.handle.state() == ReconcilerState::Live)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive every trade forwarded by any pair.
    pub fn subscribe_trades(&self) -> broadcast::Receiver<NormalizedMessage> {
        self.shared.trades.subscribe()
    }

    /// Feed kind this tracker reconciles.
    pub fn feed_kind(&self) -> FeedKind {
        self.shared.feed_kind
    }

    /// Reconciler restarts after fatal book errors, across all pairs.
    pub fn reconciler_restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Messages waiting for `trading_pair` to register.
    pub fn orphaned_messages(&self, trading_pair: &str) -> usize {
        self.shared.router.orphan_len(trading_pair)
    }

    fn spawn_pair(&self, trading_pair: String) {
        let handle = BookHandle::new(trading_pair.clone());
        let (pair_shutdown, pair_shutdown_rx) = watch::channel(false);

        let mut pairs = self.shared.pairs.write();
        let task = tokio::spawn(supervise_pair(
            Arc::clone(&self.shared),
            trading_pair.clone(),
            handle.clone(),
            pair_shutdown_rx,
        ));
        pairs.insert(
            trading_pair,
            PairTask {
                handle,
                shutdown: pair_shutdown,
                task,
            },
        );
    }
}

async fn join_or_abort(name: &str, mut task: JoinHandle<()>, deadline: tokio::time::Instant) {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Run a pair's reconciler, restarting it from scratch after fatal errors.
#[instrument(skip(shared, handle, shutdown))]
async fn supervise_pair(
    shared: Arc<Shared>,
    trading_pair: String,
    handle: BookHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reason = "initial";

    loop {
        let (tx, rx) = mpsc::channel(shared.config.message_queue_capacity.max(1));
        shared.router.register(&trading_pair, tx);
        request_snapshot(&shared, &trading_pair, reason);

        let reconciler = PairReconciler::new(
            trading_pair.clone(),
            shared.feed_kind,
            handle.clone(),
            shared.config.past_diffs_window_size,
            shared.trades.clone(),
        );
        #[cfg(test)]
        let reconciler = if shared.unchecked_messages.load(Ordering::SeqCst) {
            reconciler.skip_validation()
        } else {
            reconciler
        };

        match reconciler.run(rx, shutdown.clone()).await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, delay_ms = shared.config.restart_delay.as_millis() as u64, "Restarting reconciler");
                metrics::inc_reconciler_restarts(&trading_pair);
                shared.restarts.fetch_add(1, Ordering::Relaxed);
                shared.router.unregister(&trading_pair);
                handle.reset();
            }
        }

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return,
            _ = tokio::time::sleep(shared.config.restart_delay) => {}
        }
        reason = "restart";
    }
}

/// Fetch a snapshot for `trading_pair` in the background and route it.
///
/// Retries with backoff until it succeeds, the tracker shuts down, or the
/// pair stops being tracked. Concurrent requests for one pair collapse.
fn request_snapshot(shared: &Arc<Shared>, trading_pair: &str, reason: &'static str) {
    if !shared
        .snapshots_in_flight
        .lock()
        .insert(trading_pair.to_string())
    {
        debug!(trading_pair, reason, "Snapshot already in flight");
        return;
    }
    if reason != "initial" {
        metrics::inc_resnapshots(reason);
    }

    let shared = Arc::clone(shared);
    let trading_pair = trading_pair.to_string();
    let mut shutdown = shared.shutdown.subscribe();

    tokio::spawn(async move {
        let mut attempt = 0u32;
        let mut fetched_snapshot = None;

        while shared.is_tracked(&trading_pair) {
            let fetched = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                fetched = fetch_checked(shared.source.as_ref(), &trading_pair) => fetched,
            };

            match fetched {
                Ok(snapshot) => {
                    fetched_snapshot = Some(snapshot);
                    break;
                }
                Err(e) => {
                    metrics::inc_snapshot_failures();
                    let delay = shared.config.snapshot_backoff.next_delay(attempt);
                    warn!(
                        trading_pair = %trading_pair,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Snapshot fetch failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        // Clear before routing so a request racing the delivery is not lost.
        shared.snapshots_in_flight.lock().remove(&trading_pair);

        if let Some(snapshot) = fetched_snapshot {
            if shared.is_tracked(&trading_pair) {
                debug!(trading_pair = %trading_pair, sequence = snapshot.sequence, reason, "Routing snapshot");
                shared.router.route(snapshot);
            }
        }
    });
}

async fn fetch_checked(
    source: &dyn SnapshotSource,
    trading_pair: &str,
) -> Result<NormalizedMessage, FeedError> {
    let snapshot = source.fetch_snapshot(trading_pair).await?;
    if snapshot.trading_pair != trading_pair {
        return Err(FeedError::SnapshotFailed {
            trading_pair: trading_pair.to_string(),
            reason: format!("source returned a snapshot for {}", snapshot.trading_pair),
        });
    }
    Ok(snapshot)
}

fn spawn_ingestion(shared: &Arc<Shared>, mut feed: mpsc::Receiver<FeedEvent>) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    let mut shutdown = shared.shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                event = feed.recv() => event,
            };

            match event {
                Some(FeedEvent::Message(message)) => {
                    shared.router.route(message);
                }
                Some(FeedEvent::Reconnected) => {
                    let pairs = shared.pair_names();
                    info!(pairs = pairs.len(), "Feed reconnected, resnapshotting all pairs");
                    for pair in &pairs {
                        request_snapshot(&shared, pair, "reconnect");
                    }
                }
                None => {
                    info!("Feed closed");
                    break;
                }
            }
        }
    })
}

fn spawn_resync(shared: &Arc<Shared>, mut resync_rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    let mut shutdown = shared.shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            let pair = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                pair = resync_rx.recv() => pair,
            };
            let Some(pair) = pair else { break };

            if shared.is_tracked(&pair) {
                request_snapshot(&shared, &pair, "queue_overflow");
            }
        }
    })
}

fn spawn_refresh(shared: &Arc<Shared>, interval: Duration) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    let mut shutdown = shared.shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; the initial snapshot covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            for pair in shared.pair_names() {
                request_snapshot(&shared, &pair, "refresh");
            }
        }
    })
}
