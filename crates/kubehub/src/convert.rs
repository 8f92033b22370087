//! Translation between kube `DynamicObject`s and kind-erased `RawObject`s.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta as KubeMeta, OwnerReference as KubeOwner, Time};
use kiln_core::{ObjectMeta, OwnerReference, RawObject, ResourceKind};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use serde_json::{json, Value};

use crate::kpack;

pub const GROUP: &str = "apps.kiln.dev";
pub const VERSION: &str = "v1alpha1";

/// API resource backing `kind`. Build jobs are written as kpack Images.
pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::EnvSecret => ApiResource::erase::<Secret>(&()),
        ResourceKind::BuildJob => kpack::image_resource(),
        other => ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, other.as_str())),
    }
}

fn api_version(kind: ResourceKind) -> String { api_resource(kind).api_version }

pub fn meta_from_kube(m: &KubeMeta) -> ObjectMeta {
    ObjectMeta {
        name: m.name.clone().unwrap_or_default(),
        namespace: m.namespace.clone().unwrap_or_default(),
        uid: m.uid.clone(),
        resource_version: m.resource_version.clone(),
        labels: m.labels.clone().unwrap_or_default(),
        annotations: m.annotations.clone().unwrap_or_default(),
        // foreign owners are not tracked
        owner_references: m
            .owner_references
            .iter()
            .flatten()
            .filter_map(|o| {
                ResourceKind::from_name(&o.kind).map(|kind| OwnerReference { kind, name: o.name.clone(), uid: o.uid.clone() })
            })
            .collect(),
        creation_timestamp: m.creation_timestamp.as_ref().map(|t| t.0),
    }
}

pub fn meta_to_kube(m: &ObjectMeta) -> KubeMeta {
    let non_empty = |map: &BTreeMap<String, String>| (!map.is_empty()).then(|| map.clone());
    KubeMeta {
        name: Some(m.name.clone()),
        namespace: (!m.namespace.is_empty()).then(|| m.namespace.clone()),
        uid: m.uid.clone(),
        resource_version: m.resource_version.clone(),
        labels: non_empty(&m.labels),
        annotations: non_empty(&m.annotations),
        owner_references: (!m.owner_references.is_empty()).then(|| {
            m.owner_references
                .iter()
                .map(|o| KubeOwner {
                    api_version: api_version(o.kind),
                    kind: o.kind.as_str().to_string(),
                    name: o.name.clone(),
                    uid: o.uid.clone(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                })
                .collect()
        }),
        creation_timestamp: m.creation_timestamp.map(Time),
        ..Default::default()
    }
}

pub fn raw_from_dynamic(kind: ResourceKind, obj: &DynamicObject) -> RawObject {
    let metadata = meta_from_kube(&obj.metadata);
    if kind == ResourceKind::EnvSecret {
        return RawObject { kind, metadata, spec: json!({ "data": secret_data(&obj.data) }), status: Value::Null };
    }
    RawObject {
        kind,
        metadata,
        spec: obj.data.get("spec").cloned().unwrap_or(Value::Null),
        status: obj.data.get("status").cloned().unwrap_or(Value::Null),
    }
}

pub fn dynamic_from_raw(raw: &RawObject) -> DynamicObject {
    let ar = api_resource(raw.kind);
    let data = if raw.kind == ResourceKind::EnvSecret {
        let plain: BTreeMap<String, String> =
            raw.spec.get("data").and_then(|d| serde_json::from_value(d.clone()).ok()).unwrap_or_default();
        let encoded: serde_json::Map<String, Value> =
            plain.into_iter().map(|(k, v)| (k, Value::String(STANDARD.encode(v.as_bytes())))).collect();
        json!({ "type": "Opaque", "data": encoded })
    } else {
        let mut data = json!({ "spec": raw.spec });
        if !raw.status.is_null() {
            data["status"] = raw.status.clone();
        }
        data
    };
    DynamicObject {
        types: Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() }),
        metadata: meta_to_kube(&raw.metadata),
        data,
    }
}

/// Secret values, base64-decoded; `stringData` entries win.
pub fn secret_data(data: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = data.get("data").and_then(Value::as_object) {
        for (k, v) in map {
            let decoded = v.as_str().and_then(|s| STANDARD.decode(s).ok()).map(|b| String::from_utf8_lossy(&b).into_owned());
            if let Some(value) = decoded {
                out.insert(k.clone(), value);
            }
        }
    }
    if let Some(map) = data.get("stringData").and_then(Value::as_object) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kiln_kinds_map_to_crds() {
        let ar = api_resource(ResourceKind::Process);
        assert_eq!(ar.api_version, "apps.kiln.dev/v1alpha1");
        assert_eq!(ar.plural, "processes");
        assert_eq!(api_resource(ResourceKind::EnvSecret).plural, "secrets");
        assert_eq!(api_resource(ResourceKind::BuildJob).group, "kpack.io");
    }

    #[test]
    fn metadata_round_trips_and_drops_foreign_owners() {
        let mut meta = ObjectMeta { name: "a1-web".into(), namespace: "space".into(), ..Default::default() };
        meta.labels.insert("apps.kiln.dev/appGuid".into(), "a1".into());
        meta.owner_references.push(OwnerReference { kind: ResourceKind::App, name: "a1".into(), uid: "u-1".into() });
        let mut kube = meta_to_kube(&meta);
        assert_eq!(kube.owner_references.as_ref().unwrap()[0].api_version, "apps.kiln.dev/v1alpha1");
        assert!(kube.annotations.is_none());

        kube.owner_references.as_mut().unwrap().push(KubeOwner {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "rs".into(),
            uid: "u-2".into(),
            ..Default::default()
        });
        assert_eq!(meta_from_kube(&kube), meta);
    }

    #[test]
    fn secret_values_are_decoded_and_encoded() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "a1-env", "namespace": "space" },
            "data": { "PORT": STANDARD.encode("8080"), "BROKEN": "%%%" },
            "stringData": { "MODE": "prod" }
        }))
        .unwrap();
        let raw = raw_from_dynamic(ResourceKind::EnvSecret, &obj);
        assert_eq!(raw.spec, json!({ "data": { "MODE": "prod", "PORT": "8080" } }));

        let back = dynamic_from_raw(&raw);
        assert_eq!(back.data["data"]["PORT"], json!(STANDARD.encode("8080")));
        assert_eq!(back.types.unwrap().kind, "Secret");
    }

    #[test]
    fn spec_and_status_live_under_data() {
        let raw = RawObject {
            kind: ResourceKind::Droplet,
            metadata: ObjectMeta { name: "droplet-b1".into(), namespace: "space".into(), ..Default::default() },
            spec: json!({ "appRef": "a1" }),
            status: Value::Null,
        };
        let obj = dynamic_from_raw(&raw);
        assert_eq!(obj.data, json!({ "spec": { "appRef": "a1" } }));
        assert_eq!(raw_from_dynamic(ResourceKind::Droplet, &obj), raw);
    }
}
