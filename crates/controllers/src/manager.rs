//! Wires reconcilers, queues and watch streams into one running engine.

use std::sync::Arc;

use futures::future::join_all;
use kiln_core::{Delta, LabelSelector, ResourceKind};
use kiln_store::ResourceStore;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::AppReconciler;
use crate::config::ControllerConfig;
use crate::controller::{Controller, Reconciler};
use crate::error::ReconcileResult;
use crate::fanout::{fan_out, Route};
use crate::image::{ImageConfigSource, NoImageConfig};
use crate::jobs::BuildJobBackend;
use crate::process::ProcessReconciler;
use crate::queue::{Backoff, WorkQueue};
use crate::staging::StagingReconciler;

pub struct Manager {
    store: Arc<dyn ResourceStore>,
    config: Arc<ControllerConfig>,
    controllers: Vec<Arc<Controller>>,
    routes: Vec<Route>,
}

impl Manager {
    /// Empty manager; add reconcilers with [`Manager::register`].
    pub fn new(store: Arc<dyn ResourceStore>, config: ControllerConfig) -> Self {
        Self { store, config: Arc::new(config), controllers: Vec::new(), routes: Vec::new() }
    }

    /// Staging, App and Process reconcilers with every route between them.
    pub fn standard(store: Arc<dyn ResourceStore>, jobs: Arc<dyn BuildJobBackend>, config: ControllerConfig) -> Self {
        Self::standard_with_images(store, jobs, Arc::new(NoImageConfig), config)
    }

    /// Like [`Manager::standard`], reading droplet process types and ports from `images`.
    pub fn standard_with_images(
        store: Arc<dyn ResourceStore>,
        jobs: Arc<dyn BuildJobBackend>,
        images: Arc<dyn ImageConfigSource>,
        config: ControllerConfig,
    ) -> Self {
        let mut m = Self::new(Arc::clone(&store), config);
        let config = Arc::clone(&m.config);
        let staging = StagingReconciler::new(Arc::clone(&store), jobs, Arc::clone(&config)).with_image_config(images);
        m.register(Arc::new(staging));
        m.register(Arc::new(AppReconciler::new(Arc::clone(&store), config)));
        m.register(Arc::new(ProcessReconciler::new(store)));
        m.routes.extend(Route::ALL);
        m
    }

    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> &mut Self {
        let backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let queue = Arc::new(WorkQueue::new(backoff));
        self.controllers.push(Arc::new(Controller::new(reconciler, queue, self.config.reconcile_timeout)));
        self
    }

    pub fn route(&mut self, route: Route) -> &mut Self {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
        self
    }

    pub fn queue(&self, kind: ResourceKind) -> Option<Arc<WorkQueue>> {
        self.controllers.iter().find(|c| c.kind() == kind).map(|c| Arc::clone(c.queue()))
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ReconcileResult {
        let queues: Arc<FxHashMap<ResourceKind, Arc<WorkQueue>>> =
            Arc::new(self.controllers.iter().map(|c| (c.kind(), Arc::clone(c.queue()))).collect());

        // Subscribe before listing so nothing written in between is missed.
        let mut sources: Vec<ResourceKind> = queues.keys().copied().collect();
        for route in &self.routes {
            if !sources.contains(&route.source()) {
                sources.push(route.source());
            }
        }
        sources.sort();
        let streams: Vec<_> = sources.iter().map(|k| (*k, self.store.watch(*k))).collect();

        for controller in &self.controllers {
            let kind = controller.kind();
            let objects = self.store.list(kind, None, &LabelSelector::default()).await?;
            info!(%kind, count = objects.len(), "initial resync");
            for obj in objects {
                controller.queue().add(obj.key());
            }
        }

        let routes: Arc<[Route]> = self.routes.clone().into();
        let pumps: Vec<JoinHandle<()>> = streams
            .into_iter()
            .map(|(kind, rx)| {
                tokio::spawn(pump(kind, rx, Arc::clone(&self.store), Arc::clone(&routes), Arc::clone(&queues)))
            })
            .collect();

        let mut workers = Vec::new();
        for controller in &self.controllers {
            workers.extend(controller.spawn_workers(self.config.workers));
        }
        info!(controllers = self.controllers.len(), workers = workers.len(), routes = routes.len(), "manager started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("shutting down");
        for pump in &pumps {
            pump.abort();
        }
        for queue in queues.values() {
            queue.shutdown();
        }
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("manager stopped");
        Ok(())
    }
}

/// Forward one kind's changes to its own queue and through the routes.
async fn pump(
    kind: ResourceKind,
    mut rx: mpsc::UnboundedReceiver<Delta>,
    store: Arc<dyn ResourceStore>,
    routes: Arc<[Route]>,
    queues: Arc<FxHashMap<ResourceKind, Arc<WorkQueue>>>,
) {
    while let Some(delta) = rx.recv().await {
        if let Some(queue) = queues.get(&kind) {
            queue.add(delta.key());
        }
        match fan_out(store.as_ref(), &routes, &delta).await {
            Ok(targets) => {
                for (target, key) in targets {
                    if let Some(queue) = queues.get(&target) {
                        queue.add(key);
                    }
                }
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "kind" => kind.as_str(), "error" => "fan_out");
                warn!(%kind, key = %delta.key(), error = %e, "fan-out failed");
            }
        }
    }
    debug!(%kind, "watch stream closed");
}
