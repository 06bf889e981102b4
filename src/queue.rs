//! A deduplicating work queue with per-key retry backoff.
//!
//! A key is held in at most one of two places at a time: the pending queue, or
//! the set of keys currently being processed. Adding a key that is already
//! pending is a no-op; adding a key that is being processed marks it dirty so
//! it is queued again once [`WorkQueue::done`] is called. This guarantees at
//! most one in-flight reconcile per key while never losing a notification.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::Notify;

/// Shortest retry delay handed out for a failing key
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BACKOFF);
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt after `failures` previous failures
    pub fn delay(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: Backoff,
    depth: Option<IntGauge>,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self::build(backoff, None)
    }

    /// Like [`WorkQueue::new`], reporting the number of pending keys on `depth`
    pub fn with_depth_gauge(backoff: Backoff, depth: IntGauge) -> Self {
        Self::build(backoff, Some(depth))
    }

    fn build(backoff: Backoff, depth: Option<IntGauge>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
                depth,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn report_depth(&self, inner: &Inner<K>) {
        if let Some(depth) = &self.shared.depth {
            depth.set(inner.queue.len() as i64);
        }
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down || !inner.dirty.insert(key.clone()) {
            return;
        }
        if inner.processing.contains(&key) {
            // picked up again by `done`
            return;
        }
        inner.queue.push_back(key);
        self.report_depth(&inner);
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Wait for the next pending key and mark it as processing.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    self.report_depth(&inner);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`, queueing it again if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            self.report_depth(&inner);
            drop(inner);
            self.shared.notify.notify_one();
        }
    }

    /// Add `key` after `delay` has passed
    pub fn requeue_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Record a failure for `key` and return how long to wait before retrying it
    pub fn backoff_for(&self, key: &K) -> Duration {
        let mut inner = self.lock();
        let failures = inner.failures.entry(key.clone()).or_insert(0);
        let delay = self.shared.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Requeue `key` with its next backoff delay, returning that delay
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.backoff_for(&key);
        self.requeue_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be picked up
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` has been handed out by `get` and not yet marked `done`
    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    /// Stop accepting keys and release every waiting `get`
    pub fn shut_down(&self) {
        let mut inner = self.lock();
        inner.shutting_down = true;
        inner.queue.clear();
        inner.dirty.clear();
        self.report_depth(&inner);
        drop(inner);
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(4), Duration::from_millis(80));
        assert_eq!(backoff.delay(8), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn zero_base_is_raised_to_the_minimum() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        for failures in 0..5 {
            assert!(backoff.delay(failures) >= MIN_BACKOFF);
        }
        assert_eq!(backoff.delay(0), MIN_BACKOFF);
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = queue();
        queue.add("dev/a".to_string());
        queue.add("dev/a".to_string());
        queue.add("dev/b".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("dev/a"));
        assert_eq!(queue.get().await.as_deref(), Some("dev/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_waits_for_done() {
        let queue = queue();
        let key = "dev/a".to_string();
        queue.add(key.clone());
        let got = queue.get().await.unwrap();

        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty(), "in-flight key must not be queued twice");

        queue.done(&got);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add("dev/a".to_string());
        let key = queue.get().await.unwrap();
        assert!(queue.is_processing(&key));
        queue.done(&key);
        assert!(!queue.is_processing(&key));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue = queue();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;

        queue.add("dev/a".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("dev/a"));
    }

    #[tokio::test]
    async fn shut_down_releases_waiters_and_rejects_adds() {
        let queue = queue();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("dev/a".to_string());
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_delays_the_key() {
        let queue = queue();
        let key = "dev/a".to_string();
        queue.add(key.clone());
        let got = queue.get().await.unwrap();

        let start = Instant::now();
        queue.requeue_after(got.clone(), Duration::from_millis(300));
        queue.done(&got);

        assert!(timeout(Duration::from_millis(200), queue.get())
            .await
            .is_err());
        assert_eq!(queue.get().await, Some(key));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn rate_limited_requeues_grow_until_forgotten() {
        let queue = queue();
        let key = "dev/a".to_string();

        assert_eq!(queue.backoff_for(&key), Duration::from_millis(100));
        assert_eq!(queue.backoff_for(&key), Duration::from_millis(200));
        assert_eq!(queue.backoff_for(&key), Duration::from_millis(400));
        assert_eq!(queue.num_requeues(&key), 3);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
        assert_eq!(queue.backoff_for(&key), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn backoff_is_tracked_per_key() {
        let queue = queue();
        queue.backoff_for(&"dev/a".to_string());
        queue.backoff_for(&"dev/a".to_string());

        assert_eq!(
            queue.backoff_for(&"dev/b".to_string()),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn depth_gauge_follows_pending_keys() {
        let gauge = IntGauge::new("test_queue_depth", "pending keys").unwrap();
        let queue = WorkQueue::with_depth_gauge(Backoff::default(), gauge.clone());

        queue.add("dev/a".to_string());
        queue.add("dev/b".to_string());
        assert_eq!(gauge.get(), 2);

        let key = queue.get().await.unwrap();
        assert_eq!(gauge.get(), 1);
        queue.done(&key);
        assert_eq!(gauge.get(), 1);
    }
}
