//! App reconciler: derives Processes from the App's current droplet.

use std::sync::Arc;

use kiln_core::conditions::{set_condition, READY};
use kiln_core::prelude::*;
use kiln_core::{LABEL_APP_GUID, LABEL_PROCESS_GUID, LABEL_PROCESS_TYPE};
use kiln_store::{typed, OpResult, ResourceStore};
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::controller::Reconciler;
use crate::error::ReconcileResult;

/// Port exposed when the droplet declares none.
pub const DEFAULT_PORT: i32 = 8080;

pub fn process_name(app: &str, process_type: &str) -> String { format!("{app}-{process_type}") }

/// Instances a freshly created process starts with; later edits are kept.
pub fn initial_instances(process_type: &str) -> i32 { if process_type == WEB_PROCESS_TYPE { 1 } else { 0 } }

pub fn effective_ports(droplet: &Droplet) -> Vec<i32> {
    if droplet.spec.ports.is_empty() { vec![DEFAULT_PORT] } else { droplet.spec.ports.clone() }
}

pub struct AppReconciler {
    store: Arc<dyn ResourceStore>,
    config: Arc<ControllerConfig>,
}

impl AppReconciler {
    pub fn new(store: Arc<dyn ResourceStore>, config: Arc<ControllerConfig>) -> Self { Self { store, config } }

    async fn dependencies(&self, app: &App, droplet_ref: &str) -> ReconcileResult<Droplet> {
        let store = self.store.as_ref();
        let droplet = typed::get::<Droplet>(store, &app.key().sibling(droplet_ref)).await?;
        if let Some(secret) = app.spec.env_secret_name.as_deref().filter(|s| !s.is_empty()) {
            typed::get::<EnvSecret>(store, &app.key().sibling(secret)).await?;
        }
        Ok(droplet)
    }

    /// Copy the droplet's default process and ports onto the App spec.
    async fn sync_derived_fields(&self, app: App, droplet: &Droplet) -> ReconcileResult<App> {
        let mut desired = app.clone();
        if let Some(default) = droplet.default_process() {
            desired.spec.process_type = default.type_.clone();
            desired.spec.command = default.command.clone();
        }
        desired.spec.ports = effective_ports(droplet);
        if desired.spec == app.spec {
            return Ok(app);
        }
        debug!(app = %app.key(), process_type = %desired.spec.process_type, "updating derived app fields");
        Ok(typed::update(self.store.as_ref(), &desired).await?)
    }

    async fn write_process(&self, app: &App, droplet: &Droplet, process: &DropletProcessType) -> ReconcileResult<OpResult> {
        let key = app.key().sibling(process_name(&app.metadata.name, &process.type_));
        let owner = OwnerReference::to(app);
        let memory_mb = if app.spec.memory_mb > 0 { app.spec.memory_mb } else { self.config.default_memory_mb };
        let disk_quota_mb = if app.spec.disk_quota_mb > 0 { app.spec.disk_quota_mb } else { self.config.default_disk_mb };
        let (_, op) = typed::create_or_update::<Process, _>(self.store.as_ref(), &key, |p| {
            let fresh = p.metadata.uid.is_none();
            let labels = &mut p.metadata.labels;
            labels.insert(LABEL_APP_GUID.into(), app.metadata.name.clone());
            labels.insert(LABEL_PROCESS_GUID.into(), key.name.clone());
            labels.insert(LABEL_PROCESS_TYPE.into(), process.type_.clone());
            if !p.metadata.owner_references.contains(&owner) {
                p.metadata.owner_references.push(owner);
            }
            let spec = &mut p.spec;
            spec.app_ref = app.metadata.name.clone();
            spec.process_type = process.type_.clone();
            spec.command = process.command.clone();
            if fresh {
                spec.instances = initial_instances(&process.type_);
            }
            spec.memory_mb = memory_mb;
            spec.disk_quota_mb = disk_quota_mb;
            spec.ports = effective_ports(droplet);
            spec.health_check = app.spec.health_check.clone().unwrap_or_default();
        })
        .await?;
        Ok(op)
    }

    /// Delete processes this app created for types the droplet no longer declares.
    async fn prune_processes(&self, app: &App, droplet: &Droplet) -> ReconcileResult<usize> {
        let store = self.store.as_ref();
        let Some(uid) = app.metadata.uid.as_deref() else { return Ok(0) };
        let selector = LabelSelector::new().eq(LABEL_APP_GUID, app.metadata.name.clone());
        let mut pruned = 0;
        for process in typed::list::<Process>(store, Some(&app.metadata.namespace), &selector).await? {
            let declared = droplet.spec.process_types.iter().any(|t| t.type_ == process.spec.process_type);
            if declared || !process.metadata.is_owned_by(uid) {
                continue;
            }
            if typed::delete_if_exists::<Process>(store, &process.key()).await? {
                info!(app = %app.key(), process = %process.key(), process_type = %process.spec.process_type, "pruned process");
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[async_trait::async_trait]
impl Reconciler for AppReconciler {
    fn kind(&self) -> ResourceKind { ResourceKind::App }

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let store = self.store.as_ref();
        let Some(app) = typed::get_opt::<App>(store, key).await? else {
            debug!(app = %key, "app gone");
            return Ok(());
        };
        // Nothing to run until a droplet is chosen; the App changing will bring us back.
        let Some(droplet_ref) = app.spec.current_droplet_ref.clone().filter(|s| !s.is_empty()) else {
            return Ok(());
        };

        let droplet = match self.dependencies(&app, &droplet_ref).await {
            Ok(d) => d,
            Err(e) => {
                let mut app = app;
                if set_condition(&mut app.status.conditions, READY, ConditionStatus::False, e.condition_reason(), &e.to_string()) {
                    typed::update_status(store, &app).await?;
                }
                return Err(e);
            }
        };

        let mut app = self.sync_derived_fields(app, &droplet).await?;
        let mut changed = 0usize;
        for process in &droplet.spec.process_types {
            if self.write_process(&app, &droplet, process).await? != OpResult::Unchanged {
                changed += 1;
            }
        }
        changed += self.prune_processes(&app, &droplet).await?;
        if changed > 0 {
            info!(app = %key, droplet = %droplet_ref, processes = changed, "processes converged");
        }

        let message = format!("running droplet {droplet_ref}");
        if set_condition(&mut app.status.conditions, READY, ConditionStatus::True, "DropletReady", &message) {
            typed::update_status(store, &app).await?;
        }
        Ok(())
    }
}
