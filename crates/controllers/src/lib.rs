//! Kiln controllers: the convergence engine.
//!
//! Builds are staged into Droplets, the App's current Droplet is expanded into
//! Processes, and every running Process is materialized as a Workload. Each
//! reconciler is a stateless pass over freshly read objects, driven by a
//! per-kind deduplicating work queue.

#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod fanout;
pub mod image;
pub mod jobs;
pub mod manager;
pub mod process;
pub mod queue;
pub mod staging;

pub use app::AppReconciler;
pub use config::ControllerConfig;
pub use controller::{Controller, Reconciler};
pub use error::{ReconcileError, ReconcileResult};
pub use fanout::{fan_out, Route};
pub use image::{ImageConfig, ImageConfigSource, NoImageConfig};
pub use jobs::{BuildJobBackend, JobRef, JobRequest, JobStatus, StoreJobBackend};
pub use manager::Manager;
pub use process::ProcessReconciler;
pub use queue::{Backoff, WorkQueue};
pub use staging::StagingReconciler;
