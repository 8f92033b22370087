#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kiln_controllers::ControllerConfig;
use kiln_core::prelude::*;
use kiln_store::{typed, MemoryStore};

pub const NS: &str = "space";

pub fn key(name: &str) -> ObjectKey { ObjectKey::new(NS, name) }

pub fn store() -> Arc<MemoryStore> { Arc::new(MemoryStore::new()) }

pub fn config() -> ControllerConfig {
    ControllerConfig {
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(100),
        registry_tag_base: "reg.example/apps".into(),
        ..ControllerConfig::default()
    }
}

pub async fn seed_app(store: &MemoryStore, name: &str, kind: LifecycleKind, state: DesiredState) -> App {
    let mut app = App::named(&key(name));
    app.spec.name = format!("{name}-display");
    app.spec.desired_state = state;
    app.spec.lifecycle.kind = kind;
    typed::create(store, &app).await.unwrap()
}

pub async fn seed_package(store: &MemoryStore, name: &str, app: &str, image: &str) -> Package {
    let mut pkg = Package::named(&key(name));
    pkg.spec.app_ref = app.into();
    pkg.spec.source.registry.image = image.into();
    pkg.spec.source.registry.image_pull_secrets = vec!["pull-secret".into()];
    typed::create(store, &pkg).await.unwrap()
}

pub async fn seed_build(store: &MemoryStore, name: &str, app: &str, package: &str, kind: LifecycleKind) -> Build {
    let mut build = Build::named(&key(name));
    build.spec.app_ref = app.into();
    build.spec.package_ref = package.into();
    build.spec.lifecycle.kind = kind;
    typed::create(store, &build).await.unwrap()
}

/// Report a job outcome the way a build backend would.
pub async fn finish_job(store: &MemoryStore, job: &str, status: BuildJobStatus) {
    let mut j: BuildJob = typed::get(store, &key(job)).await.unwrap();
    j.status = status;
    typed::update_status(store, &j).await.unwrap();
}

pub fn job_succeeded(image: &str, processes: &[(&str, &str)]) -> BuildJobStatus {
    BuildJobStatus {
        phase: JobPhase::Succeeded,
        latest_image: image.into(),
        process_types: processes
            .iter()
            .map(|(t, c)| DropletProcessType { type_: t.to_string(), command: c.to_string(), default: false })
            .collect(),
        ..Default::default()
    }
}

pub fn condition(conds: &[Condition], type_: &str) -> Option<Condition> {
    kiln_core::conditions::find_condition(conds, type_).cloned()
}

/// Poll `check` until it yields a value or five seconds pass.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(v) = check().await {
            return v;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
