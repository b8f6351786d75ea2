//! Rate-limited work queue.
//!
//! Keys are deduplicated while waiting, and a key is never handed to two
//! workers at once: a key re-added while it is being processed is parked
//! and queued again when [`WorkQueue::done`] is called. Failed keys are
//! re-added after a per-key exponential backoff that [`WorkQueue::forget`]
//! resets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// First retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: waiting in `queue` or parked behind an
    /// in-flight run.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Cloneable handle to a shared queue.
pub struct WorkQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
    notify: Arc<Notify>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            })),
            notify: Arc::new(Notify::new()),
            base_delay,
            max_delay,
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`done`](WorkQueue::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`. If it was re-added meanwhile it is queued
    /// again.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Add `key` after `delay`. Needs a Tokio runtime when `delay` is
    /// non-zero.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.inner.lock().shutting_down {
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

    /// Add `key` after its next backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut inner = self.inner.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = backoff(self.base_delay, self.max_delay, *failures);
            *failures = failures.saturating_add(1);
            delay
        };
        trace!(?delay, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.lock().failures.remove(key);
    }

    /// How many times `key` has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting (not counting in-flight keys).
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting `get`.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.min(63);
    let nanos = base.as_nanos().saturating_mul(1u128 << exp);
    if nanos >= max.as_nanos() {
        return max;
    }
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedups_waiting_keys() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_readded_while_processing_waits_for_done() {
        let q = WorkQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = WorkQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shut_down_unblocks_get() {
        let q: WorkQueue<&str> = WorkQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_keys_come_back() {
        let q = WorkQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);

        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn waiting_workers_share_keys() {
        let q = WorkQueue::new();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        q.add(1);
        q.add(2);
        q.add(3);

        let mut got = Vec::new();
        for w in workers {
            let key = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
            got.push(key.unwrap());
        }
        got.sort();
        assert_eq!(got, [1, 2, 3]);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = DEFAULT_BASE_DELAY;
        let max = DEFAULT_MAX_DELAY;
        assert_eq!(backoff(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff(base, max, 4), Duration::from_millis(80));
        assert_eq!(backoff(base, max, 30), max);
        assert_eq!(backoff(base, max, u32::MAX), max);
    }
}
