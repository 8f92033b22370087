use std::time::Duration;

/// Tunables for the convergence engine, read from `KILN_*` variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker tasks per controller.
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Build jobs push to `<registry_tag_base>/<app>`.
    pub registry_tag_base: String,
    pub builder_name: String,
    pub build_service_account: String,
    /// Point an App without a current droplet at the first droplet staged for it.
    pub auto_select_droplet: bool,
    pub default_memory_mb: i64,
    pub default_disk_mb: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(60),
            registry_tag_base: "registry.local/kiln".into(),
            builder_name: "kiln-builder".into(),
            build_service_account: "kiln-build".into(),
            auto_select_droplet: true,
            default_memory_mb: 1024,
            default_disk_mb: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary variable lookup; unset or unparsable values keep defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        let text = |k: &str| get(k).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            workers: num("KILN_WORKERS").map(|n| n.max(1) as usize).unwrap_or(d.workers),
            reconcile_timeout: num("KILN_RECONCILE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.reconcile_timeout),
            backoff_base: num("KILN_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: num("KILN_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            registry_tag_base: text("KILN_REGISTRY_TAG_BASE").unwrap_or(d.registry_tag_base),
            builder_name: text("KILN_BUILDER_NAME").unwrap_or(d.builder_name),
            build_service_account: text("KILN_BUILD_SERVICE_ACCOUNT").unwrap_or(d.build_service_account),
            auto_select_droplet: get("KILN_AUTO_SELECT_DROPLET")
                .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(d.auto_select_droplet),
            default_memory_mb: num("KILN_DEFAULT_MEMORY_MB").map(|n| n as i64).unwrap_or(d.default_memory_mb),
            default_disk_mb: num("KILN_DEFAULT_DISK_MB").map(|n| n as i64).unwrap_or(d.default_disk_mb),
        }
    }
}
