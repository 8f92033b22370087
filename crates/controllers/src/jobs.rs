//! Build-job backend: the opaque asynchronous step that turns a source image
//! into a runnable image.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_core::prelude::*;
use kiln_core::{LABEL_APP_GUID, LABEL_BUILD_GUID};
use kiln_store::{typed, ResourceStore};
use tracing::debug;

use crate::error::{ReconcileError, ReconcileResult};

/// Stable job name for a build, so resubmission is idempotent.
pub fn job_name(build: &str) -> String { format!("build-job-{build}") }

/// What to build and where to push it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub build: ObjectKey,
    pub app: String,
    pub spec: BuildJobSpec,
}

/// Handle to a submitted job, resolvable through the build label alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
    pub build: String,
}

impl JobRef {
    pub fn for_build(build: &ObjectKey) -> Self {
        Self { namespace: build.namespace.clone(), name: job_name(&build.name), build: build.name.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded { image: String, process_types: Vec<DropletProcessType>, ports: Vec<i32> },
    Failed { reason: String, message: String },
}

#[async_trait::async_trait]
pub trait BuildJobBackend: Send + Sync {
    /// Create or update the job for `request.build`.
    async fn submit(&self, request: &JobRequest) -> ReconcileResult<JobRef>;

    /// Latest outcome of the job; `NotReady` when no job can be found.
    async fn terminal_status(&self, job: &JobRef) -> ReconcileResult<JobStatus>;
}

/// Human readable failure text, naming the failed step when there is one.
pub fn failure_message(status: &BuildJobStatus) -> String {
    match &status.failed_step {
        Some(step) => format!(
            "build failed during step execution: reason '{}', message '{}'",
            step.reason, step.message
        ),
        None => format!("build job unsuccessful: reason '{}', message '{}'", status.reason, status.message),
    }
}

/// Outcome of a job object as seen through the store.
pub fn job_status(job: &BuildJob) -> JobStatus {
    let status = &job.status;
    match status.phase {
        JobPhase::Pending => JobStatus::Pending,
        JobPhase::Succeeded if status.latest_image.trim().is_empty() => JobStatus::Failed {
            reason: "NoImage".into(),
            message: format!("build job {} succeeded without reporting an image", job.metadata.name),
        },
        JobPhase::Succeeded => JobStatus::Succeeded {
            image: status.latest_image.clone(),
            process_types: status.process_types.clone(),
            ports: status.ports.clone(),
        },
        JobPhase::Failed => JobStatus::Failed {
            reason: if status.reason.is_empty() { "Failed".into() } else { status.reason.clone() },
            message: failure_message(status),
        },
    }
}

/// Backend that records jobs as `BuildJob` objects in the store and leaves
/// running them to whoever watches that kind.
pub struct StoreJobBackend {
    store: Arc<dyn ResourceStore>,
}

impl StoreJobBackend {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl BuildJobBackend for StoreJobBackend {
    async fn submit(&self, request: &JobRequest) -> ReconcileResult<JobRef> {
        let job = JobRef::for_build(&request.build);
        let key = request.build.sibling(&job.name);
        let labels: BTreeMap<String, String> = [
            (LABEL_BUILD_GUID.to_string(), request.build.name.clone()),
            (LABEL_APP_GUID.to_string(), request.app.clone()),
        ]
        .into_iter()
        .collect();
        let (_, op) = typed::create_or_update::<BuildJob, _>(self.store.as_ref(), &key, |j| {
            j.metadata.labels.extend(labels);
            j.spec = request.spec.clone();
        })
        .await?;
        debug!(job = %key, ?op, "submitted build job");
        Ok(job)
    }

    async fn terminal_status(&self, job: &JobRef) -> ReconcileResult<JobStatus> {
        let selector = LabelSelector::new().eq(LABEL_BUILD_GUID, &job.build);
        let jobs: Vec<BuildJob> = typed::list(self.store.as_ref(), Some(&job.namespace), &selector).await?;
        let latest = jobs
            .iter()
            .max_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
            .ok_or_else(|| ReconcileError::NotReady(format!("no build job found for build {}/{}", job.namespace, job.build)))?;
        Ok(job_status(latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_step_takes_precedence_in_message() {
        let mut status = BuildJobStatus {
            phase: JobPhase::Failed,
            reason: "BuildFailed".into(),
            message: "compile error".into(),
            ..Default::default()
        };
        assert_eq!(failure_message(&status), "build job unsuccessful: reason 'BuildFailed', message 'compile error'");
        status.failed_step = Some(StepFailure { reason: "Error".into(), message: "detect failed".into(), exit_code: 1 });
        assert!(failure_message(&status).contains("detect failed"));
    }

    #[test]
    fn succeeded_without_image_is_a_failure() {
        let mut job = BuildJob::default();
        job.status.phase = JobPhase::Succeeded;
        assert!(matches!(job_status(&job), JobStatus::Failed { .. }));
        job.status.latest_image = "reg/app@sha256:1".into();
        assert!(matches!(job_status(&job), JobStatus::Succeeded { ref image, .. } if image == "reg/app@sha256:1"));
    }

    #[test]
    fn job_ref_uses_stable_name() {
        let r = JobRef::for_build(&ObjectKey::new("ns", "b1"));
        assert_eq!(r.name, "build-job-b1");
        assert_eq!(r.build, "b1");
    }
}
