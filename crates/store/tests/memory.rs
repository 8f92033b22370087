#![forbid(unsafe_code)]

use kiln_core::prelude::*;
use kiln_core::LABEL_APP_GUID;
use kiln_store::{typed, MemoryStore, OpResult, ResourceStore, StoreError};

fn key(name: &str) -> ObjectKey { ObjectKey::new("space", name) }

fn app(name: &str) -> App {
    let mut a = App::named(&key(name));
    a.spec.name = name.to_string();
    a
}

#[tokio::test]
async fn create_assigns_identity_and_rejects_duplicates() {
    let store = MemoryStore::new();
    let created = typed::create(&store, &app("a1")).await.unwrap();
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());
    assert!(created.metadata.creation_timestamp.is_some());

    let err = typed::create(&store, &app("a1")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[tokio::test]
async fn stale_version_is_a_conflict() {
    let store = MemoryStore::new();
    let v1 = typed::create(&store, &app("a1")).await.unwrap();

    let mut first = v1.clone();
    first.spec.memory_mb = 256;
    typed::update(&store, &first).await.unwrap();

    let mut second = v1.clone();
    second.spec.memory_mb = 512;
    let err = typed::update(&store, &second).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    let current: App = typed::get(&store, &key("a1")).await.unwrap();
    assert_eq!(current.spec.memory_mb, 256);
}

#[tokio::test]
async fn identical_update_is_not_a_write() {
    let store = MemoryStore::new();
    let v1 = typed::create(&store, &app("a1")).await.unwrap();
    let writes = store.write_count();
    let same = typed::update(&store, &v1).await.unwrap();
    assert_eq!(same.metadata.resource_version, v1.metadata.resource_version);
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn update_and_status_touch_separate_sections() {
    let store = MemoryStore::new();
    let v1 = typed::create(&store, &app("a1")).await.unwrap();

    let mut with_status = v1.clone();
    with_status.spec.memory_mb = 999; // ignored by status writes
    kiln_core::conditions::set_condition(&mut with_status.status.conditions, "Ready", ConditionStatus::True, "Ok", "");
    let v2 = typed::update_status(&store, &with_status).await.unwrap();
    assert_eq!(v2.spec.memory_mb, 0);
    assert_eq!(v2.status.conditions.len(), 1);

    let mut with_spec = v2.clone();
    with_spec.spec.memory_mb = 128;
    with_spec.status.conditions.clear(); // ignored by spec writes
    let v3 = typed::update(&store, &with_spec).await.unwrap();
    assert_eq!(v3.spec.memory_mb, 128);
    assert_eq!(v3.status.conditions.len(), 1);
}

#[tokio::test]
async fn create_or_update_reports_outcome() {
    let store = MemoryStore::new();
    let (_, op) = typed::create_or_update::<App, _>(&store, &key("a1"), |a| a.spec.memory_mb = 64).await.unwrap();
    assert_eq!(op, OpResult::Created);
    let (_, op) = typed::create_or_update::<App, _>(&store, &key("a1"), |a| a.spec.memory_mb = 64).await.unwrap();
    assert_eq!(op, OpResult::Unchanged);
    let (a, op) = typed::create_or_update::<App, _>(&store, &key("a1"), |a| a.spec.memory_mb = 128).await.unwrap();
    assert_eq!(op, OpResult::Updated);
    assert_eq!(a.spec.memory_mb, 128);
}

#[tokio::test]
async fn list_filters_by_namespace_and_labels() {
    let store = MemoryStore::new();
    for (ns, name, owner) in [("space", "p1", "a"), ("space", "p2", "b"), ("other", "p3", "a")] {
        let mut p = Process::named(&ObjectKey::new(ns, name));
        p.metadata.labels.insert(LABEL_APP_GUID.into(), owner.into());
        typed::create(&store, &p).await.unwrap();
    }
    let sel = LabelSelector::new().eq(LABEL_APP_GUID, "a");
    let in_space: Vec<Process> = typed::list(&store, Some("space"), &sel).await.unwrap();
    assert_eq!(in_space.len(), 1);
    assert_eq!(in_space[0].metadata.name, "p1");
    let everywhere: Vec<Process> = typed::list(&store, None, &sel).await.unwrap();
    assert_eq!(everywhere.len(), 2);
}

#[tokio::test]
async fn delete_cascades_through_owner_references() {
    let store = MemoryStore::new();
    let a = typed::create(&store, &app("a1")).await.unwrap();
    let mut p = Process::named(&key("a1-web"));
    p.metadata.owner_references.push(OwnerReference::to(&a));
    let p = typed::create(&store, &p).await.unwrap();
    let mut w = Workload::named(&key("a1-web"));
    w.metadata.owner_references.push(OwnerReference::to(&p));
    typed::create(&store, &w).await.unwrap();
    typed::create(&store, &app("unrelated")).await.unwrap();

    store.delete(ResourceKind::App, &key("a1")).await.unwrap();
    assert!(typed::get_opt::<Process>(&store, &key("a1-web")).await.unwrap().is_none());
    assert!(typed::get_opt::<Workload>(&store, &key("a1-web")).await.unwrap().is_none());
    assert_eq!(store.len(), 1);

    assert!(!typed::delete_if_exists::<App>(&store, &key("a1")).await.unwrap());
}

#[tokio::test]
async fn watch_delivers_changes_for_its_kind_only() {
    let store = MemoryStore::new();
    let mut apps = store.watch(ResourceKind::App);
    let created = typed::create(&store, &app("a1")).await.unwrap();
    typed::create(&store, &Droplet::named(&key("d1"))).await.unwrap();
    store.delete(ResourceKind::App, &created.key()).await.unwrap();

    let first = apps.recv().await.unwrap();
    assert_eq!(first.kind, DeltaKind::Applied);
    assert_eq!(first.key(), key("a1"));
    let second = apps.recv().await.unwrap();
    assert_eq!(second.kind, DeltaKind::Deleted);
    assert_eq!(second.resource_kind(), ResourceKind::App);
    assert!(apps.try_recv().is_err());
}
