//! Build staging state machine.
//!
//! A Build moves through `(Succeeded, Staging)`:
//!
//! | Succeeded | Staging | step                                              |
//! |-----------|---------|---------------------------------------------------|
//! | Unknown   | Unknown | start: pass the image through or submit a job     |
//! | Unknown   | True    | wait for the job to reach a terminal phase        |
//! | Unknown   | False   | record the outcome, write the Droplet on success  |
//! | known     | any     | terminal, nothing to do                           |
//!
//! `Staging` only ever moves `Unknown -> True -> False` or `Unknown -> False`,
//! and `Succeeded` never leaves a known value.

use std::sync::Arc;

use kiln_core::conditions::{ensure_condition, set_condition, READY, STAGING, SUCCEEDED};
use kiln_core::prelude::*;
use kiln_core::{LABEL_APP_GUID, LABEL_BUILD_GUID};
use kiln_store::{typed, ResourceStore};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::controller::Reconciler;
use crate::error::{ReconcileError, ReconcileResult};
use crate::image::{ImageConfigSource, NoImageConfig};
use crate::jobs::{BuildJobBackend, JobRef, JobRequest, JobStatus};

pub const REASON_SOURCE_NOT_READY: &str = "SourceNotReady";
pub const REASON_BUILD_FAILED: &str = "BuildFailed";

pub fn droplet_name(build: &str) -> String { format!("droplet-{build}") }

pub struct StagingReconciler {
    store: Arc<dyn ResourceStore>,
    jobs: Arc<dyn BuildJobBackend>,
    images: Arc<dyn ImageConfigSource>,
    config: Arc<ControllerConfig>,
}

enum Outcome {
    Succeeded { registry: Registry, process_types: Vec<DropletProcessType>, ports: Vec<i32> },
    Failed(String),
}

impl StagingReconciler {
    pub fn new(store: Arc<dyn ResourceStore>, jobs: Arc<dyn BuildJobBackend>, config: Arc<ControllerConfig>) -> Self {
        Self { store, jobs, images: Arc::new(NoImageConfig), config }
    }

    /// Read process types and ports the build output did not report from the image itself.
    pub fn with_image_config(mut self, images: Arc<dyn ImageConfigSource>) -> Self {
        self.images = images;
        self
    }

    async fn dependencies(&self, build: &Build) -> ReconcileResult<(App, Package)> {
        let key = build.key();
        if build.spec.app_ref.is_empty() || build.spec.package_ref.is_empty() {
            return Err(ReconcileError::Invalid(format!("build {key} must name both an app and a package")));
        }
        let store = self.store.as_ref();
        let app = typed::get::<App>(store, &key.sibling(&build.spec.app_ref)).await?;
        let package = typed::get::<Package>(store, &key.sibling(&build.spec.package_ref)).await?;
        Ok((app, package))
    }

    /// Not started: pass an image through, or hand the source to the build backend.
    async fn start(&self, build: &mut Build, app: &App, package: &Package) -> ReconcileResult {
        let kind = build.spec.lifecycle.kind;
        let Some(image) = package.source_image() else {
            return Err(source_not_ready(build, package));
        };
        match kind {
            LifecycleKind::Image => {
                let conds = &mut build.status.conditions;
                set_condition(conds, STAGING, ConditionStatus::False, kind.title(), "");
                set_condition(conds, READY, ConditionStatus::False, kind.title(), "");
                info!(build = %build.key(), image, "image staged");
            }
            LifecycleKind::Buildpack => {
                let request = self.job_request(build, app, package);
                let job = self.jobs.submit(&request).await?;
                let conds = &mut build.status.conditions;
                set_condition(conds, STAGING, ConditionStatus::True, kind.title(), "");
                set_condition(conds, READY, ConditionStatus::False, kind.title(), "");
                info!(build = %build.key(), job = %job.name, tag = %request.spec.tag, "build job submitted");
            }
        }
        Ok(())
    }

    /// Staging in progress: flip `Staging` once the job has finished.
    async fn observe_job(&self, build: &mut Build) -> ReconcileResult {
        let status = self.jobs.terminal_status(&JobRef::for_build(&build.key())).await?;
        let conds = &mut build.status.conditions;
        match status {
            JobStatus::Pending => debug!(build = %build.key(), "build job still running"),
            JobStatus::Succeeded { .. } => {
                set_condition(conds, STAGING, ConditionStatus::False, "Succeeded", "");
            }
            JobStatus::Failed { message, .. } => {
                set_condition(conds, STAGING, ConditionStatus::False, "Failed", &message);
            }
        }
        Ok(())
    }

    /// Staging complete: turn the result into a Droplet or a recorded failure.
    async fn complete(&self, build: &mut Build, app: &App, package: &Package) -> ReconcileResult {
        let kind = build.spec.lifecycle.kind;
        let pull_secrets = package.spec.source.registry.image_pull_secrets.clone();
        let outcome = match kind {
            LifecycleKind::Image => {
                let Some(image) = package.source_image() else {
                    return Err(source_not_ready(build, package));
                };
                Outcome::Succeeded {
                    registry: Registry { image: image.to_string(), image_pull_secrets: pull_secrets },
                    process_types: Vec::new(),
                    ports: Vec::new(),
                }
            }
            LifecycleKind::Buildpack => match self.jobs.terminal_status(&JobRef::for_build(&build.key())).await? {
                JobStatus::Pending => {
                    return Err(ReconcileError::NotReady(format!("build job for {} has not finished", build.key())));
                }
                JobStatus::Succeeded { image, process_types, ports } => Outcome::Succeeded {
                    registry: Registry { image, image_pull_secrets: pull_secrets },
                    process_types,
                    ports,
                },
                JobStatus::Failed { message, .. } => Outcome::Failed(message),
            },
        };

        match outcome {
            Outcome::Succeeded { registry, mut process_types, mut ports } => {
                if process_types.is_empty() || ports.is_empty() {
                    let found = self.images.image_config(&registry, &build.metadata.namespace).await?;
                    debug!(build = %build.key(), image = %registry.image, ?found, "image config read");
                    if process_types.is_empty() {
                        process_types = found.process_types;
                    }
                    if ports.is_empty() {
                        ports = found.ports;
                    }
                }
                if process_types.is_empty() {
                    process_types.push(default_web_process());
                }
                let droplet = self.write_droplet(build, app, registry, process_types, ports).await?;
                build.status.droplet_ref = Some(droplet.metadata.name.clone());
                if self.config.auto_select_droplet && app.spec.current_droplet_ref.is_none() {
                    let mut selected = app.clone();
                    selected.spec.current_droplet_ref = Some(droplet.metadata.name.clone());
                    typed::update(self.store.as_ref(), &selected).await?;
                    info!(app = %app.key(), droplet = %droplet.metadata.name, "selected droplet for app");
                }
                let conds = &mut build.status.conditions;
                set_condition(conds, SUCCEEDED, ConditionStatus::True, kind.title(), "");
                set_condition(conds, READY, ConditionStatus::True, kind.title(), "");
                info!(build = %build.key(), droplet = %droplet.metadata.name, "staging succeeded");
            }
            Outcome::Failed(message) => {
                let conds = &mut build.status.conditions;
                set_condition(conds, SUCCEEDED, ConditionStatus::False, REASON_BUILD_FAILED, &message);
                set_condition(conds, READY, ConditionStatus::False, REASON_BUILD_FAILED, &message);
                warn!(build = %build.key(), %message, "staging failed");
            }
        }
        Ok(())
    }

    async fn write_droplet(
        &self,
        build: &Build,
        app: &App,
        registry: Registry,
        process_types: Vec<DropletProcessType>,
        ports: Vec<i32>,
    ) -> ReconcileResult<Droplet> {
        let key = build.key().sibling(droplet_name(&build.metadata.name));
        let owner = OwnerReference::to(build);
        let (droplet, op) = typed::create_or_update::<Droplet, _>(self.store.as_ref(), &key, |d| {
            d.metadata.labels.insert(LABEL_BUILD_GUID.into(), build.metadata.name.clone());
            d.metadata.labels.insert(LABEL_APP_GUID.into(), app.metadata.name.clone());
            if !d.metadata.owner_references.contains(&owner) {
                d.metadata.owner_references.push(owner);
            }
            d.spec = DropletSpec {
                lifecycle_kind: build.spec.lifecycle.kind,
                app_ref: app.metadata.name.clone(),
                build_ref: build.metadata.name.clone(),
                registry,
                process_types,
                ports,
            };
        })
        .await?;
        debug!(droplet = %key, ?op, "droplet written");
        Ok(droplet)
    }

    fn job_request(&self, build: &Build, app: &App, package: &Package) -> JobRequest {
        let lifecycle = &build.spec.lifecycle.data;
        let fallback = &app.spec.lifecycle.data;
        JobRequest {
            build: build.key(),
            app: app.metadata.name.clone(),
            spec: BuildJobSpec {
                tag: format!("{}/{}", self.config.registry_tag_base.trim_end_matches('/'), app.metadata.name),
                builder: self.config.builder_name.clone(),
                service_account: self.config.build_service_account.clone(),
                source: package.spec.source.registry.clone(),
                sub_path: package.spec.source.sub_path.clone(),
                buildpacks: if lifecycle.buildpacks.is_empty() { fallback.buildpacks.clone() } else { lifecycle.buildpacks.clone() },
                stack: if lifecycle.stack.is_empty() { fallback.stack.clone() } else { lifecycle.stack.clone() },
            },
        }
    }
}

fn default_web_process() -> DropletProcessType {
    DropletProcessType { type_: WEB_PROCESS_TYPE.into(), command: String::new(), default: true }
}

/// Mark the build as waiting on its source and return the retryable error.
fn source_not_ready(build: &mut Build, package: &Package) -> ReconcileError {
    let message = format!("package {} has no source image yet", package.metadata.name);
    set_condition(&mut build.status.conditions, READY, ConditionStatus::False, REASON_SOURCE_NOT_READY, &message);
    ReconcileError::NotReady(message)
}

#[async_trait::async_trait]
impl Reconciler for StagingReconciler {
    fn kind(&self) -> ResourceKind { ResourceKind::Build }

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let store = self.store.as_ref();
        let Some(mut build) = typed::get_opt::<Build>(store, key).await? else {
            debug!(build = %key, "build gone");
            return Ok(());
        };
        let observed = build.status.clone();
        let succeeded = ensure_condition(&mut build.status.conditions, SUCCEEDED);
        let staging = ensure_condition(&mut build.status.conditions, STAGING);

        let result = if succeeded.is_known() {
            Ok(())
        } else {
            match self.dependencies(&build).await {
                Ok((app, package)) => match staging {
                    ConditionStatus::Unknown => self.start(&mut build, &app, &package).await,
                    ConditionStatus::True => self.observe_job(&mut build).await,
                    ConditionStatus::False => self.complete(&mut build, &app, &package).await,
                },
                Err(e) => {
                    set_condition(&mut build.status.conditions, READY, ConditionStatus::False, e.condition_reason(), &e.to_string());
                    Err(e)
                }
            }
        };

        if build.status != observed {
            typed::update_status(store, &build).await?;
        }
        result
    }
}
