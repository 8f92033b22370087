//! Maps a change on one kind to the primary keys that must be reconciled.

use kiln_core::prelude::*;
use kiln_core::{ANNOTATION_BUILD_REASON, BUILD_REASON_STACK, LABEL_APP_GUID, LABEL_BUILD_GUID};
use kiln_store::{typed, ResourceStore};
use smallvec::SmallVec;
use tracing::trace;

use crate::error::ReconcileResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Droplet → owning App.
    DropletToApp,
    /// Finished build job → the Build it stages.
    BuildJobToBuild,
    /// App → every Process of the app.
    AppToProcesses,
    /// Droplet → every Process of the droplet's app.
    DropletToProcesses,
}

impl Route {
    pub const ALL: [Route; 4] = [Route::DropletToApp, Route::BuildJobToBuild, Route::AppToProcesses, Route::DropletToProcesses];

    pub fn source(&self) -> ResourceKind {
        match self {
            Route::DropletToApp | Route::DropletToProcesses => ResourceKind::Droplet,
            Route::BuildJobToBuild => ResourceKind::BuildJob,
            Route::AppToProcesses => ResourceKind::App,
        }
    }

    pub fn target(&self) -> ResourceKind {
        match self {
            Route::DropletToApp => ResourceKind::App,
            Route::BuildJobToBuild => ResourceKind::Build,
            Route::AppToProcesses | Route::DropletToProcesses => ResourceKind::Process,
        }
    }
}

pub type Target = (ResourceKind, ObjectKey);
pub type Targets = SmallVec<[Target; 4]>;

/// Evaluate every route whose source kind matches `delta`; targets are deduplicated.
pub async fn fan_out(store: &dyn ResourceStore, routes: &[Route], delta: &Delta) -> ReconcileResult<Targets> {
    let mut out = Targets::new();
    for route in routes.iter().filter(|r| r.source() == delta.resource_kind()) {
        for target in route_targets(store, *route, delta).await? {
            if !out.contains(&target) {
                out.push(target);
            }
        }
    }
    trace!(kind = %delta.resource_kind(), key = %delta.key(), targets = out.len(), "fan-out");
    Ok(out)
}

async fn route_targets(store: &dyn ResourceStore, route: Route, delta: &Delta) -> ReconcileResult<Targets> {
    let key = delta.key();
    let mut out = Targets::new();
    match route {
        Route::DropletToApp => {
            if let Some(app) = droplet_app(&delta.object) {
                out.push((ResourceKind::App, key.sibling(app)));
            }
        }
        Route::BuildJobToBuild => {
            if let Some(build) = finished_job_build(delta) {
                out.push((ResourceKind::Build, key.sibling(build)));
            }
        }
        Route::AppToProcesses => {
            out.extend(processes_of(store, &key.namespace, &key.name).await?);
        }
        Route::DropletToProcesses => {
            if let Some(app) = droplet_app(&delta.object) {
                out.extend(processes_of(store, &key.namespace, &app).await?);
            }
        }
    }
    Ok(out)
}

/// App label, falling back to `spec.appRef`.
fn droplet_app(obj: &RawObject) -> Option<String> {
    if let Some(app) = obj.metadata.label(LABEL_APP_GUID).filter(|s| !s.is_empty()) {
        return Some(app.to_string());
    }
    obj.spec.get("appRef").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Build name for a job event worth acting on. Deletions, unlabelled jobs,
/// stack-update rebuilds and unfinished jobs are ignored.
fn finished_job_build(delta: &Delta) -> Option<String> {
    if delta.kind == DeltaKind::Deleted {
        return None;
    }
    let meta = &delta.object.metadata;
    let build = meta.label(LABEL_BUILD_GUID).filter(|s| !s.is_empty())?;
    if meta.annotation(ANNOTATION_BUILD_REASON) == Some(BUILD_REASON_STACK) {
        trace!(job = %delta.key(), "ignoring stack-update rebuild");
        return None;
    }
    let job: BuildJob = delta.object.to_typed().ok()?;
    job.status.phase.is_terminal().then(|| build.to_string())
}

async fn processes_of(store: &dyn ResourceStore, namespace: &str, app: &str) -> ReconcileResult<Vec<Target>> {
    let selector = LabelSelector::new().eq(LABEL_APP_GUID, app);
    let processes: Vec<Process> = typed::list(store, Some(namespace), &selector).await?;
    Ok(processes.iter().map(|p| (ResourceKind::Process, p.key())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_delta(kind: DeltaKind, phase: JobPhase, labels: &[(&str, &str)], reason: Option<&str>) -> Delta {
        let mut job = BuildJob::named(&ObjectKey::new("ns", "build-job-b1"));
        for (k, v) in labels {
            job.metadata.labels.insert(k.to_string(), v.to_string());
        }
        if let Some(r) = reason {
            job.metadata.annotations.insert(ANNOTATION_BUILD_REASON.into(), r.into());
        }
        job.status.phase = phase;
        Delta { kind, object: job.to_raw().unwrap() }
    }

    #[test]
    fn job_filter_keeps_only_finished_labelled_jobs() {
        let labels = [(LABEL_BUILD_GUID, "b1")];
        assert_eq!(finished_job_build(&job_delta(DeltaKind::Applied, JobPhase::Succeeded, &labels, None)).as_deref(), Some("b1"));
        assert_eq!(finished_job_build(&job_delta(DeltaKind::Applied, JobPhase::Failed, &labels, Some("CONFIG"))).as_deref(), Some("b1"));
        assert!(finished_job_build(&job_delta(DeltaKind::Applied, JobPhase::Pending, &labels, None)).is_none());
        assert!(finished_job_build(&job_delta(DeltaKind::Deleted, JobPhase::Succeeded, &labels, None)).is_none());
        assert!(finished_job_build(&job_delta(DeltaKind::Applied, JobPhase::Succeeded, &[], None)).is_none());
        assert!(finished_job_build(&job_delta(DeltaKind::Applied, JobPhase::Succeeded, &labels, Some(BUILD_REASON_STACK))).is_none());
    }

    #[test]
    fn droplet_app_falls_back_to_spec() {
        let mut d = Droplet::named(&ObjectKey::new("ns", "droplet-b1"));
        d.spec.app_ref = "from-spec".into();
        assert_eq!(droplet_app(&d.to_raw().unwrap()).as_deref(), Some("from-spec"));
        d.metadata.labels.insert(LABEL_APP_GUID.into(), "from-label".into());
        assert_eq!(droplet_app(&d.to_raw().unwrap()).as_deref(), Some("from-label"));
    }

    #[test]
    fn routes_are_keyed_by_source() {
        let from_droplet: Vec<_> = Route::ALL.iter().filter(|r| r.source() == ResourceKind::Droplet).collect();
        assert_eq!(from_droplet, vec![&Route::DropletToApp, &Route::DropletToProcesses]);
    }
}
