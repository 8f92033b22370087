use std::time::Duration;

use kiln_store::StoreError;

/// Why a reconcile pass did not converge. Every variant is retried by the
/// scheduler; terminal build failures are recorded in status instead.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("store: {0}")]
    Store(StoreError),
    #[error("build backend: {0}")]
    Backend(String),
    #[error("reconcile exceeded {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool { matches!(self, ReconcileError::Conflict(_)) }

    /// `Ready` condition reason recorded while this error keeps an object from converging.
    pub fn condition_reason(&self) -> &'static str {
        match self {
            ReconcileError::Invalid(_) => "Invalid",
            _ => "DependencyNotReady",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileError::NotReady(_) => "not_ready",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Invalid(_) => "invalid",
            ReconcileError::Store(_) => "store",
            ReconcileError::Backend(_) => "backend",
            ReconcileError::Timeout(_) => "timeout",
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => ReconcileError::Conflict(e.to_string()),
            // A referenced object that is not there yet.
            StoreError::NotFound { .. } => ReconcileError::NotReady(e.to_string()),
            other => ReconcileError::Store(other),
        }
    }
}

pub type ReconcileResult<T = ()> = Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ObjectKey, ResourceKind};

    #[test]
    fn store_errors_map_to_retry_classes() {
        let key = ObjectKey::new("ns", "a");
        let e: ReconcileError = StoreError::Conflict { kind: ResourceKind::App, key: key.clone(), message: "stale".into() }.into();
        assert!(e.is_conflict());
        let e: ReconcileError = StoreError::NotFound { kind: ResourceKind::Droplet, key }.into();
        assert_eq!(e.label(), "not_ready");
        let e: ReconcileError = StoreError::Backend("io".into()).into();
        assert_eq!(e.label(), "store");
    }
}
