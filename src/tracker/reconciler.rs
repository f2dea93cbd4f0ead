//! Per-pair reconciliation of snapshots and diffs.
//!
//! A reconciler owns one pair's book. Until the first snapshot lands it is
//! `Unseeded` and diffs are parked in a bounded window; the snapshot then
//! seeds the book, the window is replayed in sequence order and the pair
//! goes `Live`. While live the window keeps a rolling tail of applied diffs,
//! so a resnapshot that is older than the book replays what it missed.
//! Message handling is synchronous: the only suspension point
//! in [`PairReconciler::run`] is the dequeue, which is also where shutdown
//! is observed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::error::BookError;
use crate::feed::message::{FeedKind, MessageKind, NormalizedMessage};
use crate::metrics;
use crate::orderbook::active_orders::ActiveOrderTracker;
use crate::orderbook::book::OrderBook;
use crate::orderbook::types::{OrderBookView, ReconcilerState};
use crate::utils::wait_for_shutdown;

/// Recent diffs, oldest first.
///
/// Holds every diff received before the first snapshot, then the most
/// recently applied ones.
#[derive(Debug)]
pub struct PastDiffsWindow {
    diffs: VecDeque<NormalizedMessage>,
    capacity: usize,
}

impl PastDiffsWindow {
    /// Create an empty window holding at most `capacity` diffs.
    pub fn new(capacity: usize) -> Self {
        Self {
            diffs: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a diff. Returns the evicted oldest diff on overflow.
    pub fn push(&mut self, diff: NormalizedMessage) -> Option<NormalizedMessage> {
        self.diffs.push_back(diff);
        if self.diffs.len() > self.capacity {
            self.diffs.pop_front()
        } else {
            None
        }
    }

    /// Take every buffered diff, sorted ascending by sequence.
    pub fn drain_sorted(&mut self) -> Vec<NormalizedMessage> {
        let mut drained: Vec<_> = self.diffs.drain(..).collect();
        drained.sort_by_key(|diff| diff.sequence);
        drained
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }
}

/// Shared handle to one pair's book and lifecycle state.
///
/// Only the owning reconciler writes; everyone else reads copies.
#[derive(Debug, Clone)]
pub struct BookHandle {
    book: Arc<RwLock<OrderBook>>,
    state: Arc<AtomicU8>,
}

impl BookHandle {
    /// Create an empty, unseeded book.
    pub fn new(trading_pair: impl Into<String>) -> Self {
        Self {
            book: Arc::new(RwLock::new(OrderBook::new(trading_pair))),
            state: Arc::new(AtomicU8::new(ReconcilerState::Unseeded.as_u8())),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReconcilerState {
        ReconcilerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Copy the book out. Never waits on anything but the short write lock.
    pub fn view(&self) -> OrderBookView {
        let book = self.book.read();
        book.view(self.state())
    }

    /// Empty the book and mark it unseeded.
    pub fn reset(&self) {
        let mut book = self.book.write();
        book.clear();
        self.set_state(ReconcilerState::Unseeded);
    }

    /// Empty the book and mark it stopped.
    pub fn release(&self) {
        let mut book = self.book.write();
        book.clear();
        self.set_state(ReconcilerState::Stopped);
    }

    pub(crate) fn set_state(&self, state: ReconcilerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// State machine applying one pair's messages to its book.
pub struct PairReconciler {
    trading_pair: String,
    feed_kind: FeedKind,
    handle: BookHandle,
    window: PastDiffsWindow,
    active_orders: ActiveOrderTracker,
    trades: broadcast::Sender<NormalizedMessage>,
    #[cfg(test)]
    skip_validation: bool,
}

impl PairReconciler {
    /// Create a reconciler writing into `handle`.
    pub fn new(
        trading_pair: impl Into<String>,
        feed_kind: FeedKind,
        handle: BookHandle,
        past_diffs_window_size: usize,
        trades: broadcast::Sender<NormalizedMessage>,
    ) -> Self {
        Self {
            trading_pair: trading_pair.into(),
            feed_kind,
            handle,
            window: PastDiffsWindow::new(past_diffs_window_size),
            active_orders: ActiveOrderTracker::new(),
            trades,
            #[cfg(test)]
            skip_validation: false,
        }
    }

    /// Let every message through to the book unchecked.
    #[cfg(test)]
    pub(crate) fn skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    #[cfg(not(test))]
    fn validates(&self) -> bool {
        true
    }

    #[cfg(test)]
    fn validates(&self) -> bool {
        !self.skip_validation
    }

    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    pub fn state(&self) -> ReconcilerState {
        self.handle.state()
    }

    /// Diffs held in the window: pending before the first snapshot,
    /// recently applied afterwards.
    pub fn buffered_diffs(&self) -> usize {
        self.window.len()
    }

    /// Tracked individual orders (per-order feeds only).
    pub fn tracked_orders(&self) -> usize {
        self.active_orders.len()
    }

    /// Handle one message.
    ///
    /// Malformed messages are logged and dropped. Only a book invariant
    /// violation is returned as an error.
    pub fn process_message(&mut self, message: NormalizedMessage) -> Result<(), BookError> {
        if message.trading_pair != self.trading_pair {
            warn!(
                trading_pair = %self.trading_pair,
                received_for = %message.trading_pair,
                "Dropping message addressed to another pair"
            );
            metrics::inc_malformed_messages("reconciler");
            return Ok(());
        }

        let checked = if self.validates() {
            message.validate(self.feed_kind)
        } else {
            Ok(())
        };
        if let Err(e) = checked {
            warn!(error = %e, sequence = message.sequence, kind = %message.kind, "Dropping malformed message");
            metrics::inc_malformed_messages("reconciler");
            return Ok(());
        }

        metrics::record_message_lag(message.age_ms());
        let _timer = metrics::timer_apply();
        self.apply_validated(message)
    }

    /// Apply a message that already passed validation.
    pub(crate) fn apply_validated(&mut self, message: NormalizedMessage) -> Result<(), BookError> {
        match message.kind {
            MessageKind::Trade => {
                metrics::inc_trades_forwarded();
                // No subscribers is not an error.
                let _ = self.trades.send(message);
                Ok(())
            }
            MessageKind::Snapshot => self.apply_snapshot(message),
            MessageKind::Diff if self.state() == ReconcilerState::Unseeded => {
                self.buffer_diff(message);
                Ok(())
            }
            MessageKind::Diff => {
                let shared = Arc::clone(&self.handle.book);
                let mut book = shared.write();
                if self.apply_diff(&mut book, &message)? {
                    drop(book);
                    self.window.push(message);
                }
                Ok(())
            }
        }
    }

    /// Drain the queue until shutdown, the queue closing, or a fatal error.
    #[instrument(skip_all, fields(trading_pair = %self.trading_pair))]
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<NormalizedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BookError> {
        info!("Reconciler started");

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => None,
                next = queue.recv() => next,
            };

            let Some(message) = next else {
                break;
            };

            if let Err(e) = self.process_message(message) {
                error!(error = %e, "Fatal book error, reconciler exiting");
                return Err(e);
            }
        }

        self.handle.set_state(ReconcilerState::Stopped);
        info!("Reconciler stopped");
        Ok(())
    }

    fn apply_snapshot(&mut self, snapshot: NormalizedMessage) -> Result<(), BookError> {
        let NormalizedMessage {
            sequence,
            bids,
            asks,
            ..
        } = snapshot;

        let (bids, asks) = match self.feed_kind {
            FeedKind::PerOrder => self.active_orders.rebuild_from_snapshot(&bids, &asks),
            FeedKind::AggregateLevels => (bids, asks),
        };

        let was = self.handle.state();
        let pending = self.window.drain_sorted();
        let replayed = pending.len();

        let shared = Arc::clone(&self.handle.book);
        let mut book = shared.write();
        book.apply_snapshot(&bids, &asks, sequence);

        let mut applied = 0usize;
        for diff in pending {
            // Already applied while live and covered by the snapshot.
            if was != ReconcilerState::Unseeded && diff.sequence <= sequence {
                continue;
            }
            if self.apply_diff(&mut book, &diff)? {
                applied += 1;
                self.window.push(diff);
            }
        }

        self.handle.set_state(ReconcilerState::Live);
        drop(book);

        info!(
            trading_pair = %self.trading_pair,
            sequence,
            replayed,
            applied,
            previous_state = %was,
            "Snapshot applied"
        );
        Ok(())
    }

    /// Returns whether the diff changed the book.
    fn apply_diff(&mut self, book: &mut OrderBook, diff: &NormalizedMessage) -> Result<bool, BookError> {
        let applied = match self.feed_kind {
            // Stale per-order diffs must not touch the tracked orders.
            FeedKind::PerOrder if diff.sequence > book.snapshot_uid() => {
                let (bids, asks) = self.active_orders.apply_diff_entries(&diff.bids, &diff.asks);
                book.apply_diffs(&bids, &asks, diff.sequence)?
            }
            _ => book.apply_diffs(&diff.bids, &diff.asks, diff.sequence)?,
        };

        if !applied {
            metrics::inc_stale_diffs(&self.trading_pair);
        }
        Ok(applied)
    }

    fn buffer_diff(&mut self, diff: NormalizedMessage) {
        debug!(trading_pair = %self.trading_pair, sequence = diff.sequence, "Buffering diff until snapshot");
        if let Some(evicted) = self.window.push(diff) {
            warn!(
                trading_pair = %self.trading_pair,
                evicted_sequence = evicted.sequence,
                capacity = self.window.capacity,
                "Past-diffs window full, dropped oldest diff"
            );
            metrics::inc_past_diffs_overflow(&self.trading_pair);
        }
    }
}
