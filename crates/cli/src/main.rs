use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kiln_controllers::{ControllerConfig, Manager, StoreJobBackend};
use kiln_core::prelude::*;
use kiln_kubehub::{KubeStore, RegistryImageConfig};
use kiln_store::{MemoryStore, ResourceStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod demo;
mod output;

use output::Output;

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln convergence engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Log filter directives
    #[arg(long, env = "KILN_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "KILN_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    /// Kubernetes namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides on top of `KILN_*` environment configuration.
#[derive(Args, Debug, Default)]
struct EngineArgs {
    /// Workers per resource kind
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Per-reconcile deadline in seconds
    #[arg(long = "reconcile-timeout", global = true)]
    reconcile_timeout_secs: Option<u64>,
    /// Registry prefix for built images
    #[arg(long = "registry-tag-base", global = true)]
    registry_tag_base: Option<String>,
    /// Builder used for buildpack builds
    #[arg(long, global = true)]
    builder: Option<String>,
    /// Leave the App's current droplet to the client
    #[arg(long = "no-auto-select", action = ArgAction::SetTrue, global = true)]
    no_auto_select: bool,
}

impl EngineArgs {
    fn apply(&self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(n) = self.workers {
            config.workers = n.max(1);
        }
        if let Some(secs) = self.reconcile_timeout_secs {
            config.reconcile_timeout = Duration::from_secs(secs);
        }
        if let Some(base) = &self.registry_tag_base {
            config.registry_tag_base = base.clone();
        }
        if let Some(builder) = &self.builder {
            config.builder_name = builder.clone();
        }
        if self.no_auto_select {
            config.auto_select_droplet = false;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers against the current cluster until Ctrl-C
    Run,
    /// Stage and run one app on the in-memory store, then print every object
    Demo {
        /// Lifecycle of the demo app
        #[arg(long, value_enum, default_value_t = DemoLifecycle::Buildpack)]
        lifecycle: DemoLifecycle,
        /// Source image for the demo package
        #[arg(long, default_value = "docker.io/library/nginx:1.27")]
        image: String,
        /// Give up waiting for the workload after this many seconds
        #[arg(long = "wait-secs", default_value_t = 10)]
        wait_secs: u64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DemoLifecycle { Image, Buildpack }

impl From<DemoLifecycle> for LifecycleKind {
    fn from(l: DemoLifecycle) -> Self {
        match l {
            DemoLifecycle::Image => LifecycleKind::Image,
            DemoLifecycle::Buildpack => LifecycleKind::Buildpack,
        }
    }
}

/// Log to stderr so `-o json|yaml` output on stdout stays parseable.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {directives:?}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn init_metrics(listen: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = listen else { return Ok(()) };
    PrometheusBuilder::new().with_http_listener(addr).install().context("installing prometheus exporter")?;
    info!(%addr, "serving metrics");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    init_metrics(cli.metrics_addr)?;
    let config = cli.engine.apply(ControllerConfig::from_env());
    info!(workers = config.workers, timeout = ?config.reconcile_timeout, auto_select = config.auto_select_droplet, "config loaded");

    match cli.command {
        Commands::Run => {
            let kube = KubeStore::try_default(cli.namespace.clone()).await?;
            let images = Arc::new(RegistryImageConfig::new(kube.client())?);
            let store: Arc<dyn ResourceStore> = Arc::new(kube);
            let jobs = Arc::new(StoreJobBackend::new(store.clone()));
            let manager = Manager::standard_with_images(store, jobs, images, config);
            let (tx, rx) = watch::channel(false);
            let handle = tokio::spawn(manager.run(rx));
            signal::ctrl_c().await?;
            info!("Ctrl-C received; draining workers");
            if let Err(e) = tx.send(true) {
                debug!(error = %e, "manager already gone");
            }
            handle.await??;
            info!("controllers stopped");
        }
        Commands::Demo { lifecycle, image, wait_secs } => {
            let store = Arc::new(MemoryStore::new());
            let ns = cli.namespace.as_deref().unwrap_or(demo::DEMO_NAMESPACE);
            let objects = demo::run(store, config, ns, lifecycle.into(), &image, Duration::from_secs(wait_secs)).await?;
            println!("{}", output::render(cli.output, &objects, chrono::Utc::now())?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from(["kilnctl", "--workers", "0", "--builder", "paketo", "--no-auto-select", "demo", "--lifecycle", "image"]);
        let config = cli.engine.apply(ControllerConfig::default());
        assert_eq!(config.workers, 1);
        assert_eq!(config.builder_name, "paketo");
        assert!(!config.auto_select_droplet);
        assert_eq!(config.reconcile_timeout, ControllerConfig::default().reconcile_timeout);
        assert!(matches!(cli.command, Commands::Demo { lifecycle: DemoLifecycle::Image, .. }));
    }

    #[test]
    fn output_flag_is_global() {
        let cli = Cli::parse_from(["kilnctl", "demo", "-o", "yaml"]);
        assert_eq!(cli.output, Output::Yaml);
    }

    #[test]
    fn telemetry_flags() {
        let cli = Cli::parse_from(["kilnctl", "run", "--log", "kiln_controllers=debug", "--metrics-addr", "127.0.0.1:9464"]);
        assert_eq!(cli.log, "kiln_controllers=debug");
        assert_eq!(cli.metrics_addr, Some(SocketAddr::from(([127, 0, 0, 1], 9464))));
        assert!(Cli::try_parse_from(["kilnctl", "run", "--metrics-addr", "9464"]).is_err());
    }
}
