//! A reconciler bound to its work queue and worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::{ObjectKey, ResourceKind};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::queue::WorkQueue;

/// Converges one object of a single kind towards its desired state.
///
/// Implementations read everything they need from the store on each call and
/// must tolerate the object having been deleted in the meantime.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn kind(&self) -> ResourceKind;

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult;
}

pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    timeout: Duration,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>, timeout: Duration) -> Self {
        Self { reconciler, queue, timeout }
    }

    pub fn kind(&self) -> ResourceKind { self.reconciler.kind() }

    pub fn queue(&self) -> &Arc<WorkQueue> { &self.queue }

    /// Run `workers` tasks draining the queue until it shuts down.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    while this.process_next().await {}
                    debug!(kind = %this.kind(), worker = id, "worker stopped");
                })
            })
            .collect()
    }

    /// Take one key off the queue and reconcile it. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.next().await else { return false };
        let kind = self.kind().as_str();
        gauge!("queue_depth", self.queue.len() as f64, "kind" => kind);

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.reconciler.reconcile(&key)).await {
            Ok(r) => r,
            Err(_) => Err(ReconcileError::Timeout(self.timeout)),
        };
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        counter!("reconcile_total", 1u64, "kind" => kind);

        match result {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(kind, %key, "reconciled");
            }
            Err(e) if e.is_conflict() => {
                counter!("reconcile_errors_total", 1u64, "kind" => kind, "error" => e.label());
                debug!(kind, %key, error = %e, "write conflict; requeueing");
                self.queue.add(key.clone());
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "kind" => kind, "error" => e.label());
                let delay = self.queue.add_rate_limited(key.clone());
                match e {
                    ReconcileError::NotReady(_) => info!(kind, %key, error = %e, ?delay, "waiting on dependency"),
                    _ => warn!(kind, %key, error = %e, ?delay, "reconcile failed"),
                }
            }
        }
        // The requeue above lands in the dirty set and is released here.
        self.queue.done(&key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_with: fn() -> ReconcileError,
        failures: u32,
    }

    #[async_trait::async_trait]
    impl Reconciler for Flaky {
        fn kind(&self) -> ResourceKind { ResourceKind::App }

        async fn reconcile(&self, _key: &ObjectKey) -> ReconcileResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures { Err((self.fail_with)()) } else { Ok(()) }
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Reconciler for Slow {
        fn kind(&self) -> ResourceKind { ResourceKind::Process }

        async fn reconcile(&self, _key: &ObjectKey) -> ReconcileResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn controller(r: Arc<dyn Reconciler>) -> Controller {
        let queue = Arc::new(WorkQueue::new(Backoff::new(Duration::from_millis(1), Duration::from_millis(4))));
        Controller::new(r, queue, Duration::from_secs(1))
    }

    fn key() -> ObjectKey { ObjectKey::new("ns", "a") }

    #[tokio::test]
    async fn conflict_requeues_without_backoff() {
        let r = Arc::new(Flaky { calls: AtomicU32::new(0), fail_with: || ReconcileError::Conflict("stale".into()), failures: 1 });
        let c = controller(r.clone());
        c.queue().add(key());
        assert!(c.process_next().await);
        assert_eq!(c.queue().len(), 1, "conflict requeues immediately");
        assert_eq!(c.queue().failures(&key()), 0);
        assert!(c.process_next().await);
        assert_eq!(r.calls.load(Ordering::SeqCst), 2);
        assert!(c.queue().is_empty());
    }

    #[tokio::test]
    async fn errors_back_off_and_success_resets() {
        let r = Arc::new(Flaky { calls: AtomicU32::new(0), fail_with: || ReconcileError::NotReady("pkg".into()), failures: 2 });
        let c = controller(r.clone());
        c.queue().add(key());
        assert!(c.process_next().await);
        assert_eq!(c.queue().failures(&key()), 1);
        assert!(c.process_next().await);
        assert_eq!(c.queue().failures(&key()), 2);
        assert!(c.process_next().await);
        assert_eq!(c.queue().failures(&key()), 0);
        assert_eq!(r.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reconcile_times_out_into_backoff() {
        let c = controller(Arc::new(Slow));
        c.queue().add(key());
        assert!(c.process_next().await);
        assert_eq!(c.queue().failures(&key()), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let c = Arc::new(controller(Arc::new(Slow)));
        let handles = c.spawn_workers(3);
        c.queue().shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }
}
