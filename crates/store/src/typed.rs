//! Typed helpers over a kind-erased [`ResourceStore`].

use kiln_core::{LabelSelector, ObjectKey, Resource};
use tracing::debug;

use crate::{ResourceStore, StoreError, StoreResult};

pub async fn get<T: Resource>(store: &dyn ResourceStore, key: &ObjectKey) -> StoreResult<T> {
    let raw = store.get(T::KIND, key).await?;
    Ok(T::from_raw(raw)?)
}

/// Like [`get`] but maps `NotFound` to `None`.
pub async fn get_opt<T: Resource>(store: &dyn ResourceStore, key: &ObjectKey) -> StoreResult<Option<T>> {
    match get::<T>(store, key).await {
        Ok(obj) => Ok(Some(obj)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn list<T: Resource>(
    store: &dyn ResourceStore,
    namespace: Option<&str>,
    selector: &LabelSelector,
) -> StoreResult<Vec<T>> {
    store
        .list(T::KIND, namespace, selector)
        .await?
        .into_iter()
        .map(|raw| T::from_raw(raw).map_err(StoreError::from))
        .collect()
}

pub async fn create<T: Resource>(store: &dyn ResourceStore, obj: &T) -> StoreResult<T> {
    let raw = store.create(obj.to_raw()?).await?;
    Ok(T::from_raw(raw)?)
}

pub async fn update<T: Resource>(store: &dyn ResourceStore, obj: &T) -> StoreResult<T> {
    let raw = store.update(obj.to_raw()?).await?;
    Ok(T::from_raw(raw)?)
}

pub async fn update_status<T: Resource>(store: &dyn ResourceStore, obj: &T) -> StoreResult<T> {
    let raw = store.update_status(obj.to_raw()?).await?;
    Ok(T::from_raw(raw)?)
}

/// Delete if present; returns whether something was deleted.
pub async fn delete_if_exists<T: Resource>(store: &dyn ResourceStore, key: &ObjectKey) -> StoreResult<bool> {
    match store.delete(T::KIND, key).await {
        Ok(()) => Ok(true),
        Err(StoreError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Created,
    Updated,
    Unchanged,
}

/// Fetch `key`, apply `mutate`, and write back only if the result differs.
///
/// A missing object is created from `T::named(key)`. Only metadata and spec are
/// written; status changes made by `mutate` are ignored. The update carries the
/// version that was read, so a concurrent edit surfaces as `Conflict`.
pub async fn create_or_update<T, F>(store: &dyn ResourceStore, key: &ObjectKey, mutate: F) -> StoreResult<(T, OpResult)>
where
    T: Resource,
    F: FnOnce(&mut T) + Send,
{
    match get_opt::<T>(store, key).await? {
        None => {
            let mut obj = T::named(key);
            mutate(&mut obj);
            let created = create(store, &obj).await?;
            debug!(kind = %T::KIND, key = %key, "created");
            Ok((created, OpResult::Created))
        }
        Some(current) => {
            let mut desired = current.clone();
            mutate(&mut desired);
            let mut comparable = desired.clone();
            comparable.metadata_mut().resource_version = current.metadata().resource_version.clone();
            if spec_and_meta_eq(&comparable, &current)? {
                return Ok((current, OpResult::Unchanged));
            }
            let updated = update(store, &desired).await?;
            debug!(kind = %T::KIND, key = %key, "updated");
            Ok((updated, OpResult::Updated))
        }
    }
}

fn spec_and_meta_eq<T: Resource>(a: &T, b: &T) -> StoreResult<bool> {
    let (ra, rb) = (a.to_raw()?, b.to_raw()?);
    Ok(ra.metadata == rb.metadata && ra.spec == rb.spec)
}
