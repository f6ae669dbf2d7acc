//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the classic controller work queue:
//! - an item added while already pending is collapsed into the pending entry
//! - an item added while a worker is processing it is parked ("dirty") and
//!   redelivered exactly once after [`WorkQueue::done`]
//! - no item is ever handed to two workers at the same time
//! - after [`WorkQueue::shutdown`], [`WorkQueue::get`] keeps returning pending
//!   items and yields `None` once the queue is empty
//!
//! Failed items are re-added through [`WorkQueue::add_rate_limited`] with a
//! per-item exponential delay; [`WorkQueue::forget`] resets it on success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use mirror_common::metrics::{self, ControllerLabels};

/// Backoff settings for rate-limited requeues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl RateLimit {
    /// Delay before the `failures`-th retry (1-based), doubling each time
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Work queue shared by a controller's event handler and its workers
pub struct WorkQueue<T> {
    labels: ControllerLabels,
    state: Mutex<State<T>>,
    failures: Mutex<HashMap<T, u32>>,
    notify: Notify,
    rate_limit: RateLimit,
    // Cancels pending delayed adds on shutdown
    delayed: CancellationToken,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue; `labels` tag the queue depth gauge
    pub fn new(labels: ControllerLabels, rate_limit: RateLimit) -> Self {
        Self {
            labels,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            failures: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            rate_limit,
            delayed: CancellationToken::new(),
        }
    }

    /// Mark an item as needing processing
    pub fn add(&self, item: T) {
        let len = {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
            state.queue.len()
        };
        metrics::set_queue_length(&self.labels, len);
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once shut down and drained
    ///
    /// The caller must pass the item to [`WorkQueue::done`] when finished.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add can't be missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let len = state.queue.len();
                    drop(state);
                    metrics::set_queue_length(&self.labels, len);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing an item, requeueing it if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            let len = state.queue.len();
            drop(state);
            metrics::set_queue_length(&self.labels, len);
            self.notify.notify_one();
        }
    }

    /// Re-add an item after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            *count = count.saturating_add(1);
            self.rate_limit.delay(*count)
        };
        trace!(mirror = %self.labels.mirror(), resource = %self.labels.resource(), delay_ms = delay.as_millis() as u64, "delayed requeue");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.delayed.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Reset an item's backoff after success
    pub fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    /// Failures recorded for an item since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }

    /// Number of items waiting to be picked up
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no items are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake idle workers
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.delayed.cancel();
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
