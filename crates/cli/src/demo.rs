//! In-memory walkthrough: one app staged and started with a simulated build service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use kiln_controllers::{ControllerConfig, Manager, StoreJobBackend};
use kiln_core::prelude::*;
use kiln_store::{typed, MemoryStore, ResourceStore};
use tokio::sync::watch;
use tracing::{debug, info};

pub const DEMO_NAMESPACE: &str = "demo";
const APP: &str = "hello";

/// Marks every pending build job succeeded, as kpack would after a clean build.
fn spawn_builder(store: Arc<MemoryStore>) -> tokio::task::JoinHandle<()> {
    let mut jobs = store.watch(ResourceKind::BuildJob);
    tokio::spawn(async move {
        while let Some(delta) = jobs.recv().await {
            if delta.kind != DeltaKind::Applied {
                continue;
            }
            let Ok(mut job) = delta.object.to_typed::<BuildJob>() else { continue };
            if job.status.phase != JobPhase::Pending {
                continue;
            }
            job.status = BuildJobStatus {
                phase: JobPhase::Succeeded,
                latest_image: format!("{}@sha256:{}", job.spec.tag, uuid::Uuid::new_v4().simple()),
                process_types: vec![DropletProcessType { type_: "web".into(), command: "./start".into(), default: true }],
                ..Default::default()
            };
            match typed::update_status(store.as_ref(), &job).await {
                Ok(_) => info!(job = %job.metadata.name, "simulated build finished"),
                Err(e) => debug!(job = %job.metadata.name, error = %e, "simulated build lost a race"),
            }
        }
    })
}

async fn seed(store: &MemoryStore, ns: &str, lifecycle: LifecycleKind, image: &str) -> Result<()> {
    let key = |name: &str| ObjectKey::new(ns, name);

    let mut env = EnvSecret::named(&key(&format!("{APP}-env")));
    env.spec.data = BTreeMap::from([("GREETING".to_string(), "hello from kiln".to_string())]);
    typed::create(store, &env).await?;

    let mut app = App::named(&key(APP));
    app.spec.name = APP.into();
    app.spec.desired_state = DesiredState::Started;
    app.spec.lifecycle.kind = lifecycle;
    app.spec.env_secret_name = Some(env.metadata.name.clone());
    let app = typed::create(store, &app).await?;

    let mut pkg = Package::named(&key(&format!("{APP}-pkg")));
    pkg.metadata.owner_references.push(OwnerReference::to(&app));
    pkg.spec.kind = if lifecycle == LifecycleKind::Image { PackageKind::Docker } else { PackageKind::Bits };
    pkg.spec.app_ref = APP.into();
    pkg.spec.source.registry.image = image.into();
    typed::create(store, &pkg).await?;

    let mut build = Build::named(&key(&format!("{APP}-build-1")));
    build.metadata.owner_references.push(OwnerReference::to(&app));
    build.spec.app_ref = APP.into();
    build.spec.package_ref = pkg.metadata.name.clone();
    build.spec.lifecycle.kind = lifecycle;
    typed::create(store, &build).await?;
    Ok(())
}

/// Seed the demo app, converge it, and return every object in `ns`.
pub async fn run(
    store: Arc<MemoryStore>,
    config: ControllerConfig,
    ns: &str,
    lifecycle: LifecycleKind,
    image: &str,
    wait: Duration,
) -> Result<Vec<RawObject>> {
    let builder = spawn_builder(store.clone());
    let jobs = Arc::new(StoreJobBackend::new(store.clone()));
    let manager = Manager::standard(store.clone(), jobs, config);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(rx));

    seed(&store, ns, lifecycle, image).await?;
    info!(ns, lifecycle = lifecycle.title(), "demo app seeded");

    let workload = ObjectKey::new(ns, format!("{APP}-web"));
    let converged = tokio::time::timeout(wait, async {
        while typed::get_opt::<Workload>(store.as_ref(), &workload).await.ok().flatten().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();

    if let Err(e) = tx.send(true) {
        debug!(error = %e, "manager exited before shutdown was signalled");
    }
    handle.await??;
    builder.abort();
    if !converged {
        bail!("workload {workload} not created within {wait:?}");
    }

    let mut objects = Vec::new();
    for kind in ResourceKind::ALL {
        objects.extend(store.list(kind, Some(ns), &LabelSelector::new()).await?);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> ControllerConfig {
        ControllerConfig { backoff_base: Duration::from_millis(5), backoff_max: Duration::from_millis(50), ..ControllerConfig::default() }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn buildpack_demo_converges() {
        let store = Arc::new(MemoryStore::new());
        let objects = run(store, fast(), "t", LifecycleKind::Buildpack, "src:1", Duration::from_secs(5)).await.unwrap();
        let kinds: Vec<ResourceKind> = objects.iter().map(|o| o.kind).collect();
        for k in [ResourceKind::Droplet, ResourceKind::Process, ResourceKind::Workload, ResourceKind::BuildJob] {
            assert!(kinds.contains(&k), "missing {k}");
        }
        let workload: Workload = objects.iter().find(|o| o.kind == ResourceKind::Workload).unwrap().to_typed().unwrap();
        assert_eq!(workload.spec.env.get("GREETING").map(String::as_str), Some("hello from kiln"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn image_demo_skips_the_builder() {
        let store = Arc::new(MemoryStore::new());
        let objects = run(store, fast(), "t", LifecycleKind::Image, "nginx:1", Duration::from_secs(5)).await.unwrap();
        assert!(objects.iter().all(|o| o.kind != ResourceKind::BuildJob));
        let droplet: Droplet = objects.iter().find(|o| o.kind == ResourceKind::Droplet).unwrap().to_typed().unwrap();
        assert_eq!(droplet.spec.registry.image, "nginx:1");
    }
}
