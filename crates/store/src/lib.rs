//! Kiln store: the `ResourceStore` contract reconcilers program against, plus
//! an in-RAM implementation with optimistic concurrency, watches and owner GC.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_core::{Delta, DeltaKind, LabelSelector, ObjectKey, RawObject, ResourceError, ResourceKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub mod typed;

pub use typed::OpResult;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {kind} {key}")]
    NotFound { kind: ResourceKind, key: ObjectKey },
    #[error("already_exists: {kind} {key}")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },
    #[error("conflict: {kind} {key}: {message}")]
    Conflict { kind: ResourceKind, key: ObjectKey, message: String },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

impl From<ResourceError> for StoreError {
    fn from(e: ResourceError) -> Self { StoreError::Invalid(e.to_string()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Declarative object store.
///
/// `update` replaces metadata and spec, `update_status` replaces status; both
/// reject a `resource_version` that no longer matches the stored object. An
/// object without a `resource_version` is written unconditionally.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<RawObject>;

    /// List objects of `kind`, optionally restricted to a namespace and label selector.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<RawObject>>;

    async fn create(&self, obj: RawObject) -> StoreResult<RawObject>;

    async fn update(&self, obj: RawObject) -> StoreResult<RawObject>;

    async fn update_status(&self, obj: RawObject) -> StoreResult<RawObject>;

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to changes of `kind`. Only changes after the call are delivered.
    fn watch(&self, kind: ResourceKind) -> mpsc::UnboundedReceiver<Delta>;
}

type Slot = (ResourceKind, ObjectKey);

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Slot, RawObject>,
    version: u64,
    writes: u64,
    watchers: FxHashMap<ResourceKind, Vec<mpsc::UnboundedSender<Delta>>>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.writes += 1;
        self.version.to_string()
    }

    fn notify(&mut self, kind: DeltaKind, obj: &RawObject) {
        if let Some(subs) = self.watchers.get_mut(&obj.kind) {
            subs.retain(|tx| tx.send(Delta { kind, object: obj.clone() }).is_ok());
        }
    }

    fn check_version(&self, incoming: &RawObject, current: &RawObject) -> StoreResult<()> {
        match incoming.metadata.resource_version.as_deref() {
            Some(rv) if Some(rv) != current.metadata.resource_version.as_deref() => Err(StoreError::Conflict {
                kind: incoming.kind,
                key: incoming.key(),
                message: format!(
                    "stale resourceVersion {} (current {})",
                    rv,
                    current.metadata.resource_version.as_deref().unwrap_or("-")
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// In-RAM store used by tests and the demo pipeline.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Number of successful mutations so far (no-op updates excluded).
    pub fn write_count(&self) -> u64 { self.lock().writes }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<RawObject> {
        self.lock()
            .objects
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind, key: key.clone() })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<RawObject>> {
        let inner = self.lock();
        let mut out: Vec<RawObject> = inner
            .objects
            .iter()
            .filter(|((k, key), _)| *k == kind && namespace.map(|ns| key.namespace == ns).unwrap_or(true))
            .filter(|(_, obj)| selector.matches(&obj.metadata.labels))
            .map(|(_, obj)| obj.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn create(&self, mut obj: RawObject) -> StoreResult<RawObject> {
        if obj.metadata.name.is_empty() {
            return Err(StoreError::Invalid(format!("{} missing metadata.name", obj.kind)));
        }
        let mut inner = self.lock();
        let slot = (obj.kind, obj.key());
        if inner.objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists { kind: slot.0, key: slot.1 });
        }
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(inner.next_version());
        obj.metadata.creation_timestamp = Some(chrono::Utc::now());
        inner.objects.insert(slot, obj.clone());
        inner.notify(DeltaKind::Applied, &obj);
        counter!("store_writes_total", 1u64, "kind" => obj.kind.as_str(), "op" => "create");
        trace!(kind = %obj.kind, key = %obj.key(), "created");
        Ok(obj)
    }

    async fn update(&self, obj: RawObject) -> StoreResult<RawObject> {
        let mut inner = self.lock();
        let slot = (obj.kind, obj.key());
        let current = inner
            .objects
            .get(&slot)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: slot.0, key: slot.1.clone() })?;
        inner.check_version(&obj, &current)?;

        let mut next = current.clone();
        next.spec = obj.spec;
        next.metadata.labels = obj.metadata.labels;
        next.metadata.annotations = obj.metadata.annotations;
        next.metadata.owner_references = obj.metadata.owner_references;
        if next == current {
            return Ok(current);
        }
        next.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(slot, next.clone());
        inner.notify(DeltaKind::Applied, &next);
        counter!("store_writes_total", 1u64, "kind" => next.kind.as_str(), "op" => "update");
        Ok(next)
    }

    async fn update_status(&self, obj: RawObject) -> StoreResult<RawObject> {
        let mut inner = self.lock();
        let slot = (obj.kind, obj.key());
        let current = inner
            .objects
            .get(&slot)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: slot.0, key: slot.1.clone() })?;
        inner.check_version(&obj, &current)?;

        if current.status == obj.status {
            return Ok(current);
        }
        let mut next = current;
        next.status = obj.status;
        next.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(slot, next.clone());
        inner.notify(DeltaKind::Applied, &next);
        counter!("store_writes_total", 1u64, "kind" => next.kind.as_str(), "op" => "update_status");
        Ok(next)
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.lock();
        let root = inner
            .objects
            .remove(&(kind, key.clone()))
            .ok_or_else(|| StoreError::NotFound { kind, key: key.clone() })?;
        inner.writes += 1;
        inner.notify(DeltaKind::Deleted, &root);
        counter!("store_writes_total", 1u64, "kind" => kind.as_str(), "op" => "delete");

        // Cascade to dependents through owner references.
        let mut pending: Vec<String> = root.metadata.uid.into_iter().collect();
        while let Some(owner_uid) = pending.pop() {
            let dependents: Vec<Slot> = inner
                .objects
                .iter()
                .filter(|(_, o)| o.metadata.is_owned_by(&owner_uid))
                .map(|(slot, _)| slot.clone())
                .collect();
            for slot in dependents {
                if let Some(obj) = inner.objects.remove(&slot) {
                    debug!(kind = %obj.kind, key = %obj.key(), owner = %owner_uid, "garbage collected dependent");
                    inner.writes += 1;
                    inner.notify(DeltaKind::Deleted, &obj);
                    pending.extend(obj.metadata.uid.clone());
                }
            }
        }
        Ok(())
    }

    fn watch(&self, kind: ResourceKind) -> mpsc::UnboundedReceiver<Delta> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.entry(kind).or_default().push(tx);
        rx
    }
}
