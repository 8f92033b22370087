//! Resource types of the deployment pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::impl_resource;
use crate::meta::ObjectMeta;
use crate::ResourceKind;

/// Process type that receives traffic and runs one instance by default.
pub const WEB_PROCESS_TYPE: &str = "web";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Started,
    #[default]
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// Pre-built image: staging passes the package image through.
    #[serde(alias = "docker")]
    Image,
    /// Source built by the build-job backend.
    #[default]
    #[serde(alias = "kpack")]
    Buildpack,
}

impl LifecycleKind {
    /// Title-case name used as condition reason.
    pub fn title(&self) -> &'static str {
        match self {
            LifecycleKind::Image => "Image",
            LifecycleKind::Buildpack => "Buildpack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleData {
    pub buildpacks: Vec<String>,
    pub stack: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Lifecycle {
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    pub data: LifecycleData,
}

/// Image reference plus the names of pull secrets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Registry {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Http,
    Port,
    #[default]
    Process,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckType::Http => "http",
            HealthCheckType::Port => "port",
            HealthCheckType::Process => "process",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_endpoint: String,
    pub invocation_timeout_seconds: i64,
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub type_: HealthCheckType,
    pub data: HealthCheckData,
}

/// Status section for kinds whose status is owned by someone else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NoStatus {}

// ---- App ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSpec {
    /// Display name.
    pub name: String,
    pub desired_state: DesiredState,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_secret_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_droplet_ref: Option<String>,
    /// Derived from the current droplet's default process.
    pub process_type: String,
    /// Derived from the current droplet's default process.
    pub command: String,
    pub memory_mb: i64,
    pub disk_quota_mb: i64,
    pub ports: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppStatus {
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct App {
    pub metadata: ObjectMeta,
    pub spec: AppSpec,
    pub status: AppStatus,
}
impl_resource!(App, ResourceKind::App);

// ---- Package ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// Uploaded, content-addressed source bundle.
    #[default]
    Bits,
    /// External image reference.
    Docker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    Sha256,
    Sha1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checksum {
    #[serde(rename = "type")]
    pub kind: ChecksumKind,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageSource {
    pub registry: Registry,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageSpec {
    #[serde(rename = "type")]
    pub kind: PackageKind,
    pub app_ref: String,
    pub source: PackageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Package {
    pub metadata: ObjectMeta,
    pub spec: PackageSpec,
    pub status: PackageStatus,
}
impl_resource!(Package, ResourceKind::Package);

impl Package {
    /// Source image once the upload is finalized; `None` while still empty.
    pub fn source_image(&self) -> Option<&str> {
        let image = self.spec.source.registry.image.trim();
        if image.is_empty() { None } else { Some(image) }
    }
}

// ---- Build ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSpec {
    pub lifecycle: Lifecycle,
    pub package_ref: String,
    pub app_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub droplet_ref: Option<String>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Build {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
    pub status: BuildStatus,
}
impl_resource!(Build, ResourceKind::Build);

// ---- Droplet ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DropletProcessType {
    #[serde(rename = "type")]
    pub type_: String,
    pub command: String,
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DropletSpec {
    #[serde(rename = "type")]
    pub lifecycle_kind: LifecycleKind,
    pub app_ref: String,
    pub build_ref: String,
    pub registry: Registry,
    pub process_types: Vec<DropletProcessType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DropletStatus {
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Droplet {
    pub metadata: ObjectMeta,
    pub spec: DropletSpec,
    pub status: DropletStatus,
}
impl_resource!(Droplet, ResourceKind::Droplet);

impl Droplet {
    /// Process flagged default, else `web`, else the first one.
    pub fn default_process(&self) -> Option<&DropletProcessType> {
        let types = &self.spec.process_types;
        types
            .iter()
            .find(|p| p.default)
            .or_else(|| types.iter().find(|p| p.type_ == WEB_PROCESS_TYPE))
            .or_else(|| types.first())
    }
}

// ---- Process ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessSpec {
    pub app_ref: String,
    pub process_type: String,
    /// Raw launch command as declared by the droplet.
    pub command: String,
    pub instances: i32,
    pub memory_mb: i64,
    pub disk_quota_mb: i64,
    pub ports: Vec<i32>,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessStatus {
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Process {
    pub metadata: ObjectMeta,
    pub spec: ProcessSpec,
    pub status: ProcessStatus,
}
impl_resource!(Process, ResourceKind::Process);

// ---- Workload ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadProbe {
    #[serde(rename = "type")]
    pub type_: HealthCheckType,
    pub port: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSpec {
    pub guid: String,
    pub process_type: String,
    pub app_name: String,
    pub app_guid: String,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<i32>,
    pub instances: i32,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u8,
    pub health: WorkloadProbe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
    pub status: NoStatus,
}
impl_resource!(Workload, ResourceKind::Workload);

// ---- BuildJob ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum JobPhase {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool { !matches!(self, JobPhase::Pending) }
}

/// A build step that terminated with a non-zero exit code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StepFailure {
    pub reason: String,
    pub message: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildJobSpec {
    /// Destination tag for the produced image.
    pub tag: String,
    pub builder: String,
    pub service_account: String,
    pub source: Registry,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buildpacks: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stack: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildJobStatus {
    pub phase: JobPhase,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub latest_image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub process_types: Vec<DropletProcessType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BuildJob {
    pub metadata: ObjectMeta,
    pub spec: BuildJobSpec,
    pub status: BuildJobStatus,
}
impl_resource!(BuildJob, ResourceKind::BuildJob);

// ---- EnvSecret ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvSecretSpec {
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EnvSecret {
    pub metadata: ObjectMeta,
    pub spec: EnvSecretSpec,
    pub status: NoStatus,
}
impl_resource!(EnvSecret, ResourceKind::EnvSecret);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_kind_accepts_legacy_aliases() {
        let k: LifecycleKind = serde_json::from_str("\"docker\"").unwrap();
        assert_eq!(k, LifecycleKind::Image);
        let k: LifecycleKind = serde_json::from_str("\"kpack\"").unwrap();
        assert_eq!(k, LifecycleKind::Buildpack);
        assert_eq!(serde_json::to_string(&LifecycleKind::Image).unwrap(), "\"image\"");
    }

    #[test]
    fn desired_state_wire_format() {
        assert_eq!(serde_json::to_string(&DesiredState::Started).unwrap(), "\"STARTED\"");
        let s: DesiredState = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(s, DesiredState::Stopped);
    }

    #[test]
    fn package_source_image_trims_and_detects_empty() {
        let mut p = Package::default();
        assert!(p.source_image().is_none());
        p.spec.source.registry.image = "  ".into();
        assert!(p.source_image().is_none());
        p.spec.source.registry.image = "repo/app:v1".into();
        assert_eq!(p.source_image(), Some("repo/app:v1"));
    }

    #[test]
    fn default_process_prefers_flag_then_web() {
        let mut d = Droplet::default();
        assert!(d.default_process().is_none());
        d.spec.process_types = vec![
            DropletProcessType { type_: "worker".into(), command: "w".into(), default: false },
            DropletProcessType { type_: "web".into(), command: "s".into(), default: false },
        ];
        assert_eq!(d.default_process().map(|p| p.type_.as_str()), Some("web"));
        d.spec.process_types[0].default = true;
        assert_eq!(d.default_process().map(|p| p.type_.as_str()), Some("worker"));
    }
}
