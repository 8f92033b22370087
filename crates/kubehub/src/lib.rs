//! Kiln kubehub: a `ResourceStore` backed by the Kubernetes API.
//!
//! Kiln kinds live as custom resources in `apps.kiln.dev/v1alpha1` and env
//! bundles are plain Secrets. Build jobs are delegated to kpack; image configs
//! are read from the registry the image was pushed to.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::Result;
use futures::StreamExt;
use kiln_core::{Delta, DeltaKind, LabelSelector, ObjectKey, RawObject, Resource, ResourceKind};
use kiln_core::resources::BuildJob;
use kiln_store::{ResourceStore, StoreError, StoreResult};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::{counter, histogram};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod convert;
pub mod kpack;
pub mod registry;

use convert::{api_resource, dynamic_from_raw, raw_from_dynamic};
pub use registry::RegistryImageConfig;

/// Field manager recorded on server-side applies.
pub const FIELD_MANAGER: &str = "kiln";

pub struct KubeStore {
    client: Client,
    /// Namespace used when a list or watch is not scoped; `None` means all.
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }

    pub fn client(&self) -> Client { self.client.clone() }

    /// Connect with the ambient kubeconfig or in-cluster credentials.
    pub async fn try_default(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        info!(ns = ?namespace, "connected to cluster");
        Ok(Self::new(client, namespace))
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn builds_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kpack::build_resource();
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn get_job(&self, key: &ObjectKey) -> StoreResult<RawObject> {
        let image = self
            .api(ResourceKind::BuildJob, Some(&key.namespace))
            .get_opt(&key.name)
            .await
            .map_err(|e| store_error(ResourceKind::BuildJob, key, e))?
            .ok_or_else(|| StoreError::NotFound { kind: ResourceKind::BuildJob, key: key.clone() })?;
        let lp = ListParams::default().labels(&format!("{}={}", kpack::LABEL_IMAGE, key.name));
        let builds = self
            .builds_api(Some(&key.namespace))
            .list(&lp)
            .await
            .map_err(|e| store_error(ResourceKind::BuildJob, key, e))?;
        Ok(kpack::job_from_image(&image, &builds.items))
    }

    async fn apply_job(&self, raw: RawObject) -> StoreResult<RawObject> {
        let key = raw.key();
        let job = BuildJob::from_raw(raw)?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api(ResourceKind::BuildJob, Some(&key.namespace))
            .patch(&key.name, &pp, &Patch::Apply(&kpack::image_manifest(&job)))
            .await
            .map_err(|e| store_error(ResourceKind::BuildJob, &key, e))?;
        counter!("store_writes_total", 1u64, "kind" => "BuildJob", "op" => "apply");
        self.get_job(&key).await
    }
}

/// Map API status codes onto the store's error classes.
pub fn store_error(kind: ResourceKind, key: &ObjectKey, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound { kind, key: key.clone() },
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists { kind, key: key.clone() },
            409 => StoreError::Conflict { kind, key: key.clone(), message: ae.message },
            400 | 422 => StoreError::Invalid(format!("{kind} {key}: {}", ae.message)),
            _ => StoreError::Backend(format!("{kind} {key}: {} ({})", ae.message, ae.code)),
        },
        other => StoreError::Backend(format!("{kind} {key}: {other}")),
    }
}

fn label_params(selector: &LabelSelector) -> ListParams {
    if selector.is_empty() { ListParams::default() } else { ListParams::default().labels(&selector.to_query()) }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<RawObject> {
        if kind == ResourceKind::BuildJob {
            return self.get_job(key).await;
        }
        let obj = self
            .api(kind, Some(&key.namespace))
            .get_opt(&key.name)
            .await
            .map_err(|e| store_error(kind, key, e))?
            .ok_or_else(|| StoreError::NotFound { kind, key: key.clone() })?;
        Ok(raw_from_dynamic(kind, &obj))
    }

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<RawObject>> {
        let scope = ObjectKey::new(namespace.unwrap_or("*"), "*");
        let lp = label_params(selector);
        if kind == ResourceKind::BuildJob {
            let builds = self.builds_api(namespace).list(&lp).await.map_err(|e| store_error(kind, &scope, e))?;
            return Ok(builds.items.iter().map(kpack::job_from_build).collect());
        }
        let list = self.api(kind, namespace).list(&lp).await.map_err(|e| store_error(kind, &scope, e))?;
        Ok(list.items.iter().map(|o| raw_from_dynamic(kind, o)).collect())
    }

    async fn create(&self, obj: RawObject) -> StoreResult<RawObject> {
        if obj.kind == ResourceKind::BuildJob {
            return self.apply_job(obj).await;
        }
        let (kind, key) = (obj.kind, obj.key());
        let mut body = dynamic_from_raw(&obj);
        body.metadata.uid = None;
        body.metadata.resource_version = None;
        let t0 = Instant::now();
        let created = self
            .api(kind, Some(&key.namespace))
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| store_error(kind, &key, e))?;
        histogram!("store_write_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        counter!("store_writes_total", 1u64, "kind" => kind.as_str(), "op" => "create");
        Ok(raw_from_dynamic(kind, &created))
    }

    async fn update(&self, obj: RawObject) -> StoreResult<RawObject> {
        if obj.kind == ResourceKind::BuildJob {
            return self.apply_job(obj).await;
        }
        let (kind, key) = (obj.kind, obj.key());
        let t0 = Instant::now();
        let updated = self
            .api(kind, Some(&key.namespace))
            .replace(&key.name, &PostParams::default(), &dynamic_from_raw(&obj))
            .await
            .map_err(|e| store_error(kind, &key, e))?;
        histogram!("store_write_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        counter!("store_writes_total", 1u64, "kind" => kind.as_str(), "op" => "update");
        Ok(raw_from_dynamic(kind, &updated))
    }

    async fn update_status(&self, obj: RawObject) -> StoreResult<RawObject> {
        let (kind, key) = (obj.kind, obj.key());
        if matches!(kind, ResourceKind::BuildJob | ResourceKind::EnvSecret) {
            return Err(StoreError::Invalid(format!("{kind} status is not writable")));
        }
        let mut patch = json!({ "status": obj.status });
        if let Some(rv) = &obj.metadata.resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let updated = self
            .api(kind, Some(&key.namespace))
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(kind, &key, e))?;
        counter!("store_writes_total", 1u64, "kind" => kind.as_str(), "op" => "update_status");
        Ok(raw_from_dynamic(kind, &updated))
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        self.api(kind, Some(&key.namespace))
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| store_error(kind, key, e))?;
        counter!("store_writes_total", 1u64, "kind" => kind.as_str(), "op" => "delete");
        Ok(())
    }

    fn watch(&self, kind: ResourceKind) -> mpsc::UnboundedReceiver<Delta> {
        let (tx, rx) = mpsc::unbounded_channel();
        let api = if kind == ResourceKind::BuildJob { self.builds_api(None) } else { self.api(kind, None) };
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            info!(%kind, "watcher started");
            while let Some(ev) = stream.next().await {
                let deltas: Vec<Delta> = match ev {
                    Ok(watcher::Event::Applied(o)) => vec![delta(kind, DeltaKind::Applied, &o)],
                    Ok(watcher::Event::Deleted(o)) => vec![delta(kind, DeltaKind::Deleted, &o)],
                    Ok(watcher::Event::Restarted(list)) => {
                        debug!(%kind, count = list.len(), "watch restart");
                        list.iter().map(|o| delta(kind, DeltaKind::Applied, o)).collect()
                    }
                    Err(e) => {
                        counter!("watch_errors_total", 1u64, "kind" => kind.as_str());
                        warn!(%kind, error = %e, "watch error; retrying");
                        continue;
                    }
                };
                for d in deltas {
                    if tx.send(d).is_err() {
                        debug!(%kind, "watch receiver dropped");
                        return;
                    }
                }
            }
            warn!(%kind, "watcher stream ended");
        });
        rx
    }
}

fn delta(kind: ResourceKind, dk: DeltaKind, obj: &DynamicObject) -> Delta {
    let object = if kind == ResourceKind::BuildJob { kpack::job_from_build(obj) } else { raw_from_dynamic(kind, obj) };
    Delta { kind: dk, object }
}
