//! Process reconciler: turns a Process into the Workload the runtime executes.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_core::conditions::{set_condition, READY};
use kiln_core::prelude::*;
use kiln_core::{LABEL_APP_GUID, LABEL_PROCESS_GUID, LABEL_PROCESS_TYPE};
use kiln_store::{typed, ResourceStore};
use tracing::{debug, info};

use crate::app::DEFAULT_PORT;
use crate::controller::Reconciler;
use crate::error::{ReconcileError, ReconcileResult};

/// Entry point of buildpack-built images.
pub const BUILDPACK_LAUNCHER: &str = "/cnb/lifecycle/launcher";

/// Container argv for a process command.
pub fn command_argv(kind: LifecycleKind, command: &str) -> Vec<String> {
    let command = command.trim();
    if command.is_empty() {
        return Vec::new();
    }
    match kind {
        LifecycleKind::Buildpack => vec![BUILDPACK_LAUNCHER.to_string(), command.to_string()],
        LifecycleKind::Image => command.split_whitespace().map(str::to_string).collect(),
    }
}

pub fn health_probe(process: &ProcessSpec) -> WorkloadProbe {
    let check = &process.health_check;
    WorkloadProbe {
        type_: check.type_,
        port: process.ports.first().copied().unwrap_or(DEFAULT_PORT),
        endpoint: check.data.http_endpoint.clone(),
        timeout_ms: u64::try_from(check.data.timeout_seconds).unwrap_or(0).saturating_mul(1000),
    }
}

pub struct ProcessReconciler {
    store: Arc<dyn ResourceStore>,
}

enum Converged {
    Running,
    Stopped,
}

struct Inputs {
    droplet: Droplet,
    env: BTreeMap<String, String>,
}

impl ProcessReconciler {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self { Self { store } }

    async fn app(&self, process: &Process) -> ReconcileResult<App> {
        let key = process.key();
        if process.spec.app_ref.is_empty() {
            return Err(ReconcileError::Invalid(format!("process {key} has no app reference")));
        }
        Ok(typed::get::<App>(self.store.as_ref(), &key.sibling(&process.spec.app_ref)).await?)
    }

    /// Droplet and env of a started app; both must exist.
    async fn inputs(&self, process: &Process, app: &App) -> ReconcileResult<Inputs> {
        let store = self.store.as_ref();
        let key = process.key();
        let droplet_ref = app
            .spec
            .current_droplet_ref
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReconcileError::NotReady(format!("app {} has no current droplet", app.key())))?;
        let droplet = typed::get::<Droplet>(store, &key.sibling(droplet_ref)).await?;
        let env = match app.spec.env_secret_name.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => typed::get::<EnvSecret>(store, &key.sibling(name)).await?.spec.data,
            None => BTreeMap::new(),
        };
        Ok(Inputs { droplet, env })
    }

    async fn converge(&self, process: &Process) -> ReconcileResult<Converged> {
        let app = self.app(process).await?;
        let key = process.key();
        // only the App is needed to stop
        if app.spec.desired_state == DesiredState::Stopped {
            if typed::delete_if_exists::<Workload>(self.store.as_ref(), &key).await? {
                info!(process = %key, "app stopped; workload deleted");
            }
            return Ok(Converged::Stopped);
        }
        let Inputs { droplet, env } = self.inputs(process, &app).await?;

        let owner = OwnerReference::to(process);
        let spec = &process.spec;
        let (_, op) = typed::create_or_update::<Workload, _>(self.store.as_ref(), &key, |w| {
            let labels = &mut w.metadata.labels;
            labels.insert(LABEL_APP_GUID.into(), app.metadata.name.clone());
            labels.insert(LABEL_PROCESS_GUID.into(), key.name.clone());
            labels.insert(LABEL_PROCESS_TYPE.into(), spec.process_type.clone());
            if !w.metadata.owner_references.contains(&owner) {
                w.metadata.owner_references.push(owner);
            }
            w.spec = WorkloadSpec {
                guid: key.name.clone(),
                process_type: spec.process_type.clone(),
                app_name: app.spec.name.clone(),
                app_guid: app.metadata.name.clone(),
                image: droplet.spec.registry.image.clone(),
                image_pull_secrets: droplet.spec.registry.image_pull_secrets.clone(),
                command: command_argv(droplet.spec.lifecycle_kind, &spec.command),
                env,
                ports: spec.ports.clone(),
                instances: spec.instances,
                memory_mb: spec.memory_mb,
                disk_mb: spec.disk_quota_mb,
                cpu_weight: 0,
                health: health_probe(spec),
            };
        })
        .await?;
        debug!(process = %key, ?op, "workload written");
        Ok(Converged::Running)
    }
}

#[async_trait::async_trait]
impl Reconciler for ProcessReconciler {
    fn kind(&self) -> ResourceKind { ResourceKind::Process }

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let store = self.store.as_ref();
        let Some(mut process) = typed::get_opt::<Process>(store, key).await? else {
            debug!(process = %key, "process gone");
            return Ok(());
        };
        let result = self.converge(&process).await;
        let changed = match &result {
            Ok(Converged::Running) => set_condition(&mut process.status.conditions, READY, ConditionStatus::True, "Running", ""),
            Ok(Converged::Stopped) => set_condition(&mut process.status.conditions, READY, ConditionStatus::False, "Stopped", "app is stopped"),
            Err(e) => set_condition(&mut process.status.conditions, READY, ConditionStatus::False, e.condition_reason(), &e.to_string()),
        };
        if changed {
            typed::update_status(store, &process).await?;
        }
        result.map(|_| ())
    }
}
