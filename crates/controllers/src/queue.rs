//! Deduplicating work queue of object keys.
//!
//! A key is either pending, in flight, or both (dirty). Pending keys are
//! coalesced, a key re-added while in flight is parked and handed out again
//! only after `done`, so one key never has two reconciles running at once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::trace;

/// Exponential per-key retry delay: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    pending: FxHashSet<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), backoff }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shutdown {
            return;
        }
        if st.in_flight.contains(&key) {
            trace!(%key, "in flight; marked dirty");
            st.dirty.insert(key);
            return;
        }
        if st.pending.insert(key.clone()) {
            st.order.push_back(key);
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue after the key's current backoff and grow it. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let delay = {
            let mut st = self.lock();
            let failures = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn failures(&self, key: &ObjectKey) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Next key to reconcile; `None` once shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.pending.remove(&key);
                    st.in_flight.insert(key.clone());
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a dirty key goes back to the tail.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.in_flight.remove(key);
        if st.dirty.remove(key) && !st.shutdown && st.pending.insert(key.clone()) {
            st.order.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shutdown }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(name: &str) -> ObjectKey { ObjectKey::new("ns", name) }

    fn queue() -> Arc<WorkQueue> { Arc::new(WorkQueue::new(Backoff::new(Duration::from_millis(10), Duration::from_millis(80)))) }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(80));
        let delays: Vec<_> = (0..6).map(|f| b.delay(f).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80, 80]);
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn pending_keys_are_coalesced_in_fifo_order() {
        let q = queue();
        q.add(k("a"));
        q.add(k("b"));
        q.add(k("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some(k("a")));
        assert_eq!(q.next().await, Some(k("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_added_in_flight_is_held_until_done() {
        let q = queue();
        q.add(k("a"));
        let first = q.next().await.unwrap();
        q.add(k("a"));
        q.add(k("a"));
        assert!(q.is_empty(), "in-flight key must not be handed out twice");
        q.done(&first);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some(k("a")));
        q.done(&k("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_grows_until_forgotten() {
        let q = queue();
        assert_eq!(q.add_rate_limited(k("a")), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited(k("a")), Duration::from_millis(20));
        assert_eq!(q.failures(&k("a")), 2);
        q.forget(&k("a"));
        assert_eq!(q.add_rate_limited(k("a")), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delivers_later() {
        let q = queue();
        q.add_after(k("late"), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(10), q.next()).await.unwrap();
        assert_eq!(got, Some(k("late")));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(k("ignored"));
        assert!(q.is_empty());
    }
}
