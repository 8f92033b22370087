//! Process types and exposed ports read from a built image's OCI config.

use std::collections::BTreeMap;

use kiln_core::prelude::*;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ReconcileError, ReconcileResult};

/// Config label where the buildpacks lifecycle records launch processes.
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub process_types: Vec<DropletProcessType>,
    pub ports: Vec<i32>,
}

/// Looks up the config of a pushed image.
#[async_trait::async_trait]
pub trait ImageConfigSource: Send + Sync {
    async fn image_config(&self, registry: &Registry, namespace: &str) -> ReconcileResult<ImageConfig>;
}

/// Source for setups without registry access; every image looks empty.
pub struct NoImageConfig;

#[async_trait::async_trait]
impl ImageConfigSource for NoImageConfig {
    async fn image_config(&self, _: &Registry, _: &str) -> ReconcileResult<ImageConfig> { Ok(ImageConfig::default()) }
}

#[derive(Deserialize)]
struct BuildMetadata {
    #[serde(default)]
    processes: Vec<LaunchProcess>,
}

#[derive(Deserialize)]
struct LaunchProcess {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    command: Value,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    default: bool,
}

impl LaunchProcess {
    /// Command and args as one string; newer lifecycles store the command as a list.
    fn full_command(&self) -> String {
        let mut parts: Vec<&str> = match &self.command {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        parts.extend(self.args.iter().map(String::as_str));
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}

/// Parse an OCI image config file (`{"config": {"Labels": .., "ExposedPorts": ..}}`).
pub fn parse_image_config(file: &Value) -> ReconcileResult<ImageConfig> {
    let config = &file["config"];

    let mut ports = Vec::new();
    if let Some(exposed) = config["ExposedPorts"].as_object() {
        for spec in exposed.keys() {
            let number = spec.split('/').next().unwrap_or_default();
            let port = number
                .parse::<i32>()
                .map_err(|_| ReconcileError::Backend(format!("unparseable exposed port {spec:?}")))?;
            ports.push(port);
        }
    }
    ports.sort_unstable();
    ports.dedup();

    let mut process_types = Vec::new();
    if let Some(raw) = config["Labels"][BUILD_METADATA_LABEL].as_str() {
        let metadata: BuildMetadata = serde_json::from_str(raw)
            .map_err(|e| ReconcileError::Backend(format!("malformed {BUILD_METADATA_LABEL} label: {e}")))?;
        // one entry per type, last one wins
        let by_type: BTreeMap<String, DropletProcessType> = metadata
            .processes
            .iter()
            .map(|p| {
                let process = DropletProcessType { type_: p.type_.clone(), command: p.full_command(), default: p.default };
                (p.type_.clone(), process)
            })
            .collect();
        process_types = by_type.into_values().collect();
    }

    Ok(ImageConfig { process_types, ports })
}
