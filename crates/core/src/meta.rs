//! Object metadata, the kind-erased `RawObject`, and the typed `Resource` bridge.
//!
//! Stores only ever hold `RawObject`s. Typed resources convert through serde on
//! every read and write, so a value handed to a reconciler is always an owned
//! deep copy and never aliases store state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{ObjectKey, ResourceKind};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: ResourceKind, found: ResourceKind },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl OwnerReference {
    /// Back-reference to `owner`. The owner must already be persisted for the uid to be set.
    pub fn to<T: Resource>(owner: &T) -> Self {
        let meta = owner.metadata();
        Self { kind: T::KIND, name: meta.name.clone(), uid: meta.uid.clone().unwrap_or_default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Optimistic concurrency token; opaque to everything but the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(|s| s.as_str()) }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(|s| s.as_str()) }

    pub fn owner_of_kind(&self, kind: ResourceKind) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.kind == kind)
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        !uid.is_empty() && self.owner_references.iter().any(|o| o.uid == uid)
    }
}

/// Equality-based label selector (the only form reconcilers need).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.match_labels.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a Kubernetes label query (`k1=v1,k2=v2`).
    pub fn to_query(&self) -> String {
        self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// Kind-erased object as held by a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawObject {
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Json,
    #[serde(default)]
    pub status: Json,
}

impl RawObject {
    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.metadata.namespace.clone(), self.metadata.name.clone()) }

    pub fn to_typed<T: Resource>(&self) -> Result<T, ResourceError> { T::from_raw(self.clone()) }
}

/// Typed view over a `RawObject`: `{metadata, spec, status}` with a fixed kind.
pub trait Resource: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Empty object addressed by `key`.
    fn named(key: &ObjectKey) -> Self {
        let mut obj = Self::default();
        let meta = obj.metadata_mut();
        meta.name = key.name.clone();
        meta.namespace = key.namespace.clone();
        obj
    }

    fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(meta.namespace.clone(), meta.name.clone())
    }

    fn to_raw(&self) -> Result<RawObject, ResourceError> {
        let mut value = serde_json::to_value(self)?;
        let (spec, status) = match value.as_object_mut() {
            Some(map) => (map.remove("spec").unwrap_or(Json::Null), map.remove("status").unwrap_or(Json::Null)),
            None => (Json::Null, Json::Null),
        };
        Ok(RawObject { kind: Self::KIND, metadata: self.metadata().clone(), spec, status })
    }

    fn from_raw(raw: RawObject) -> Result<Self, ResourceError> {
        if raw.kind != Self::KIND {
            return Err(ResourceError::KindMismatch { expected: Self::KIND, found: raw.kind });
        }
        let mut map = serde_json::Map::new();
        map.insert("metadata".into(), serde_json::to_value(raw.metadata)?);
        // Absent sections fall back to `#[serde(default)]` instead of failing on null.
        if !raw.spec.is_null() {
            map.insert("spec".into(), raw.spec);
        }
        if !raw.status.is_null() {
            map.insert("status".into(), raw.status);
        }
        Ok(serde_json::from_value(Json::Object(map))?)
    }
}

/// Implement [`Resource`] for a `{metadata, spec, status}` struct.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::meta::Resource for $ty {
            const KIND: $crate::ResourceKind = $kind;
            fn metadata(&self) -> &$crate::meta::ObjectMeta { &self.metadata }
            fn metadata_mut(&mut self) -> &mut $crate::meta::ObjectMeta { &mut self.metadata }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{App, Droplet};

    #[test]
    fn selector_matches_and_renders_query() {
        let sel = LabelSelector::new().eq("a", "1").eq("b", "2");
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        assert!(!sel.matches(&labels));
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("c".to_string(), "3".to_string());
        assert!(sel.matches(&labels));
        assert_eq!(sel.to_query(), "a=1,b=2");
        assert!(LabelSelector::new().matches(&labels));
    }

    #[test]
    fn raw_conversion_keeps_metadata_and_rejects_wrong_kind() {
        let mut app = App::named(&ObjectKey::new("ns", "a1"));
        app.metadata.labels.insert("x".into(), "y".into());
        app.spec.name = "my-app".into();
        let raw = app.to_raw().unwrap();
        assert_eq!(raw.kind, ResourceKind::App);
        assert_eq!(raw.metadata.label("x"), Some("y"));
        assert_eq!(raw.spec["name"], "my-app");

        let back: App = raw.to_typed().unwrap();
        assert_eq!(back, app);

        let err = raw.to_typed::<Droplet>().unwrap_err();
        assert!(matches!(err, ResourceError::KindMismatch { .. }));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let raw = RawObject {
            kind: ResourceKind::App,
            metadata: ObjectMeta { name: "bare".into(), namespace: "ns".into(), ..Default::default() },
            spec: Json::Null,
            status: Json::Null,
        };
        let app: App = raw.to_typed().unwrap();
        assert_eq!(app.metadata.name, "bare");
        assert!(app.spec.current_droplet_ref.is_none());
    }
}
