//! Build jobs on kpack: a job is written as a kpack `Image` and observed
//! through the kpack `Build`s that image spawns.

use kiln_core::prelude::*;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use crate::convert::meta_from_kube;

pub const KPACK_GROUP: &str = "kpack.io";
pub const KPACK_VERSION: &str = "v1alpha2";
/// Label kpack puts on every Build pointing back at its Image.
pub const LABEL_IMAGE: &str = "image.kpack.io/image";
/// Comma-separated buildpack ids requested for the job's builds.
pub const ANNOTATION_BUILDPACKS: &str = "apps.kiln.dev/buildpacks";
pub const ANNOTATION_STACK: &str = "apps.kiln.dev/stack";

pub fn image_resource() -> ApiResource { ApiResource::from_gvk(&GroupVersionKind::gvk(KPACK_GROUP, KPACK_VERSION, "Image")) }

pub fn build_resource() -> ApiResource { ApiResource::from_gvk(&GroupVersionKind::gvk(KPACK_GROUP, KPACK_VERSION, "Build")) }

/// Server-side apply body for the Image realizing `job`.
pub fn image_manifest(job: &BuildJob) -> Value {
    let spec = &job.spec;
    let pull_secrets: Vec<Value> = spec.source.image_pull_secrets.iter().map(|n| json!({ "name": n })).collect();
    let mut source = json!({ "registry": { "image": spec.source.image, "imagePullSecrets": pull_secrets } });
    if !spec.sub_path.is_empty() {
        source["subPath"] = json!(spec.sub_path);
    }
    // kpack takes buildpacks from the builder; the request rides along so it reads back unchanged
    let mut annotations = serde_json::Map::new();
    if !spec.buildpacks.is_empty() {
        annotations.insert(ANNOTATION_BUILDPACKS.into(), json!(spec.buildpacks.join(",")));
    }
    if !spec.stack.is_empty() {
        annotations.insert(ANNOTATION_STACK.into(), json!(spec.stack));
    }
    json!({
        "apiVersion": format!("{KPACK_GROUP}/{KPACK_VERSION}"),
        "kind": "Image",
        "metadata": {
            "name": job.metadata.name,
            "namespace": job.metadata.namespace,
            "labels": job.metadata.labels,
            "annotations": annotations,
        },
        "spec": {
            "tag": spec.tag,
            "builder": { "kind": "ClusterBuilder", "name": spec.builder },
            "serviceAccountName": spec.service_account,
            "source": source,
        }
    })
}

fn spec_from(object: &DynamicObject, tag: Option<&str>) -> BuildJobSpec {
    let spec = &object.data["spec"];
    let annotation = |key: &str| object.metadata.annotations.as_ref().and_then(|a| a.get(key)).cloned().unwrap_or_default();
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    let registry = &spec["source"]["registry"];
    BuildJobSpec {
        tag: tag.map(str::to_string).unwrap_or_else(|| text(&spec["tag"])),
        builder: spec["builder"]["name"].as_str().or_else(|| spec["builder"]["image"].as_str()).unwrap_or_default().to_string(),
        service_account: text(&spec["serviceAccountName"]),
        source: Registry {
            image: text(&registry["image"]),
            image_pull_secrets: registry["imagePullSecrets"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|s| s["name"].as_str().map(str::to_string))
                .collect(),
        },
        sub_path: text(&spec["source"]["subPath"]),
        buildpacks: annotation(ANNOTATION_BUILDPACKS).split(',').filter(|b| !b.is_empty()).map(str::to_string).collect(),
        stack: annotation(ANNOTATION_STACK),
    }
}

/// Job status from a kpack Build's `Succeeded` condition and step states.
pub fn status_from_build(data: &Value) -> BuildJobStatus {
    let status = &data["status"];
    let succeeded = status["conditions"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|c| c["type"].as_str() == Some("Succeeded"));
    let (phase, reason, message) = match succeeded {
        Some(c) => {
            let phase = match ConditionStatus::parse(c["status"].as_str().unwrap_or_default()) {
                ConditionStatus::True => JobPhase::Succeeded,
                ConditionStatus::False => JobPhase::Failed,
                ConditionStatus::Unknown => JobPhase::Pending,
            };
            (phase, c["reason"].as_str().unwrap_or_default(), c["message"].as_str().unwrap_or_default())
        }
        None => (JobPhase::Pending, "", ""),
    };
    let failed_step = status["stepStates"].as_array().into_iter().flatten().find_map(|step| {
        let t = &step["terminated"];
        let code = t["exitCode"].as_i64().unwrap_or(0);
        (code != 0).then(|| StepFailure {
            reason: t["reason"].as_str().unwrap_or_default().to_string(),
            message: t["message"].as_str().unwrap_or_default().to_string(),
            exit_code: i32::try_from(code).unwrap_or(i32::MAX),
        })
    });
    BuildJobStatus {
        phase,
        latest_image: status["latestImage"].as_str().unwrap_or_default().to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        failed_step,
        ..Default::default()
    }
}

fn to_raw(job: BuildJob) -> RawObject {
    RawObject {
        kind: ResourceKind::BuildJob,
        metadata: job.metadata,
        spec: serde_json::to_value(job.spec).unwrap_or(Value::Null),
        status: serde_json::to_value(job.status).unwrap_or(Value::Null),
    }
}

/// A kpack Build seen as a job.
pub fn job_from_build(build: &DynamicObject) -> RawObject {
    let tag = build.data["spec"]["tags"].as_array().and_then(|t| t.first()).and_then(Value::as_str);
    to_raw(BuildJob {
        metadata: meta_from_kube(&build.metadata),
        spec: spec_from(build, tag),
        status: status_from_build(&build.data),
    })
}

/// A kpack Image seen as a job, with the status of its most recent Build.
pub fn job_from_image(image: &DynamicObject, builds: &[DynamicObject]) -> RawObject {
    let latest = builds.iter().max_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
    to_raw(BuildJob {
        metadata: meta_from_kube(&image.metadata),
        spec: spec_from(image, None),
        status: latest.map(|b| status_from_build(&b.data)).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ANNOTATION_BUILD_REASON, LABEL_BUILD_GUID};

    fn kpack_build(status: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "kpack.io/v1alpha2",
            "kind": "Build",
            "metadata": {
                "name": "build-job-b1-build-1",
                "namespace": "space",
                "labels": { LABEL_BUILD_GUID: "b1", LABEL_IMAGE: "build-job-b1" },
                "annotations": { ANNOTATION_BUILD_REASON: "CONFIG" }
            },
            "spec": {
                "tags": ["reg.example/apps/a1"],
                "builder": { "image": "reg.example/builder@sha256:0" },
                "serviceAccountName": "kiln-build",
                "source": { "registry": { "image": "reg.example/src/a1:upload", "imagePullSecrets": [{ "name": "pull" }] } }
            },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn image_manifest_carries_builder_and_source() {
        let mut job = BuildJob::named(&ObjectKey::new("space", "build-job-b1"));
        job.metadata.labels.insert(LABEL_BUILD_GUID.into(), "b1".into());
        job.spec = BuildJobSpec {
            tag: "reg.example/apps/a1".into(),
            builder: "kiln-builder".into(),
            service_account: "kiln-build".into(),
            source: Registry { image: "src:1".into(), image_pull_secrets: vec!["pull".into()] },
            sub_path: "api".into(),
            ..Default::default()
        };
        let m = image_manifest(&job);
        assert_eq!(m["spec"]["builder"], json!({ "kind": "ClusterBuilder", "name": "kiln-builder" }));
        assert_eq!(m["spec"]["source"]["registry"]["imagePullSecrets"], json!([{ "name": "pull" }]));
        assert_eq!(m["spec"]["source"]["subPath"], "api");
        assert_eq!(m["metadata"]["labels"][LABEL_BUILD_GUID], "b1");
        assert_eq!(m["metadata"]["annotations"], json!({}));
    }

    #[test]
    fn applied_image_reads_back_as_the_same_spec() {
        let mut job = BuildJob::named(&ObjectKey::new("space", "build-job-b1"));
        job.spec = BuildJobSpec {
            tag: "reg.example/apps/a1".into(),
            builder: "kiln-builder".into(),
            service_account: "kiln-build".into(),
            source: Registry { image: "src:1".into(), image_pull_secrets: vec!["pull".into()] },
            sub_path: "api".into(),
            buildpacks: vec!["paketo-buildpacks/go".into(), "paketo-buildpacks/procfile".into()],
            stack: "io.buildpacks.stacks.jammy".into(),
        };
        let m = image_manifest(&job);
        assert_eq!(m["metadata"]["annotations"][ANNOTATION_BUILDPACKS], "paketo-buildpacks/go,paketo-buildpacks/procfile");

        let applied: DynamicObject = serde_json::from_value(m).unwrap();
        let seen: BuildJob = job_from_image(&applied, &[]).to_typed().unwrap();
        assert_eq!(seen.spec, job.spec);
    }

    #[test]
    fn successful_build_reports_latest_image() {
        let b = kpack_build(json!({
            "latestImage": "reg.example/apps/a1@sha256:abc",
            "conditions": [{ "type": "Succeeded", "status": "True" }]
        }));
        let job: BuildJob = job_from_build(&b).to_typed().unwrap();
        assert_eq!(job.status.phase, JobPhase::Succeeded);
        assert_eq!(job.status.latest_image, "reg.example/apps/a1@sha256:abc");
        assert_eq!(job.spec.tag, "reg.example/apps/a1");
        assert_eq!(job.spec.source.image_pull_secrets, vec!["pull".to_string()]);
        assert_eq!(job.metadata.annotation(ANNOTATION_BUILD_REASON), Some("CONFIG"));
    }

    #[test]
    fn failed_step_is_extracted() {
        let b = kpack_build(json!({
            "conditions": [{ "type": "Succeeded", "status": "False", "reason": "BuildFailed", "message": "step failed" }],
            "stepStates": [
                { "terminated": { "exitCode": 0 } },
                { "terminated": { "exitCode": 51, "reason": "Error", "message": "compile error" } }
            ]
        }));
        let status = status_from_build(&b.data);
        assert_eq!(status.phase, JobPhase::Failed);
        let step = status.failed_step.unwrap();
        assert_eq!((step.exit_code, step.message.as_str()), (51, "compile error"));
    }

    #[test]
    fn image_takes_status_of_newest_build() {
        let image: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "kpack.io/v1alpha2",
            "kind": "Image",
            "metadata": { "name": "build-job-b1", "namespace": "space", "resourceVersion": "7" },
            "spec": { "tag": "reg.example/apps/a1", "builder": { "kind": "ClusterBuilder", "name": "kiln-builder" } }
        }))
        .unwrap();
        let job: BuildJob = job_from_image(&image, &[]).to_typed().unwrap();
        assert_eq!(job.status.phase, JobPhase::Pending);
        assert_eq!(job.spec.builder, "kiln-builder");
        assert_eq!(job.metadata.resource_version.as_deref(), Some("7"));

        let running = kpack_build(json!({ "conditions": [{ "type": "Succeeded", "status": "Unknown" }] }));
        let job: BuildJob = job_from_image(&image, &[running]).to_typed().unwrap();
        assert_eq!(job.status.phase, JobPhase::Pending);
    }
}
