//! Kiln core types: object identity, resource kinds, change deltas.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod meta;
pub mod resources;

pub use meta::{LabelSelector, ObjectMeta, OwnerReference, RawObject, Resource, ResourceError};

/// Label carrying the owning application name.
pub const LABEL_APP_GUID: &str = "apps.kiln.dev/appGuid";
/// Label carrying the originating build name.
pub const LABEL_BUILD_GUID: &str = "apps.kiln.dev/buildGuid";
pub const LABEL_PROCESS_GUID: &str = "apps.kiln.dev/processGuid";
pub const LABEL_PROCESS_TYPE: &str = "apps.kiln.dev/processType";
/// Annotation the build backend stamps with the reason a job was started.
pub const ANNOTATION_BUILD_REASON: &str = "image.kpack.io/reason";
/// Build reason for jobs the backend started on its own after a stack update.
pub const BUILD_REASON_STACK: &str = "STACK";

/// Closed set of kinds the convergence engine reads or writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    App,
    Package,
    Build,
    Droplet,
    Process,
    Workload,
    BuildJob,
    EnvSecret,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::App,
        ResourceKind::Package,
        ResourceKind::Build,
        ResourceKind::Droplet,
        ResourceKind::Process,
        ResourceKind::Workload,
        ResourceKind::BuildJob,
        ResourceKind::EnvSecret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::App => "App",
            ResourceKind::Package => "Package",
            ResourceKind::Build => "Build",
            ResourceKind::Droplet => "Droplet",
            ResourceKind::Process => "Process",
            ResourceKind::Workload => "Workload",
            ResourceKind::BuildJob => "BuildJob",
            ResourceKind::EnvSecret => "EnvSecret",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> { Self::ALL.into_iter().find(|k| k.as_str() == name) }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Namespaced object identity; the unit of work for reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key for another object in the same namespace.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self { namespace: self.namespace.clone(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A change notification emitted by a store watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Deep copy of the object as of the change (last known state for deletions).
    pub object: RawObject,
}

impl Delta {
    pub fn resource_kind(&self) -> ResourceKind { self.object.kind }
    pub fn key(&self) -> ObjectKey { self.object.key() }
}

pub mod prelude {
    pub use super::conditions::{Condition, ConditionStatus};
    pub use super::meta::{LabelSelector, ObjectMeta, OwnerReference, RawObject, Resource};
    pub use super::resources::*;
    pub use super::{Delta, DeltaKind, ObjectKey, ResourceKind};
}
