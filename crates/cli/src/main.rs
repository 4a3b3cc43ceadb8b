use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kwork_controller::{Controller, ControllerConfig, PrintHandler};
use kwork_core::Object;
use kwork_kubehub::WatchTarget;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kworkctl", version, about = "Watch one resource kind and reconcile every change")]
struct Cli {
    /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(long, env = "KWORK_GVK", default_value = "v1/Pod")]
    gvk: String,

    /// Namespace to watch (all namespaces when omitted)
    #[arg(long = "ns", env = "KWORK_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector passed to the watch, e.g. "app=nginx"
    #[arg(long = "selector", short = 'l')]
    label_selector: Option<String>,

    /// Field selector passed to the watch
    #[arg(long = "field-selector")]
    field_selector: Option<String>,

    /// Label key reported for every synced object
    #[arg(long, default_value = "app")]
    label: String,

    /// Concurrent workers
    #[arg(long, env = "KWORK_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Attempts per key before it is dropped
    #[arg(long, env = "KWORK_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// First retry delay in milliseconds (doubles per failure)
    #[arg(long, env = "KWORK_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "KWORK_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// Overall requeue rate
    #[arg(long, env = "KWORK_QPS", default_value_t = 10.0)]
    qps: f64,

    #[arg(long, env = "KWORK_BURST", default_value_t = 100)]
    burst: u32,

    /// Abort startup if the initial listing takes longer (0 waits forever)
    #[arg(long, env = "KWORK_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,

    /// Re-queue every cached object periodically (0 disables)
    #[arg(long, env = "KWORK_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        ControllerConfig {
            name: self.gvk.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            qps: self.qps,
            burst: self.burst,
            cache_sync_timeout: secs(self.sync_timeout_secs),
            resync_period: secs(self.resync_secs),
        }
    }

    fn watch_target(&self) -> WatchTarget {
        WatchTarget {
            gvk_key: self.gvk.clone(),
            namespace: self.namespace.clone(),
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KWORK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KWORK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KWORK_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let gvk = kwork_kubehub::parse_gvk_key(&cli.gvk)?;
    let handler = PrintHandler::stdout(gvk.kind.clone(), cli.label.clone());
    let controller = Arc::new(Controller::<Object>::new(cli.controller_config(), handler)?);

    let source = kwork_kubehub::watch_stream(&cli.watch_target())
        .await
        .with_context(|| format!("starting watch for {}", cli.gvk))?;

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("interrupt received; shutting down");
            stop.cancel();
        }
    });

    info!(gvk = %cli.gvk, ns = ?cli.namespace, workers = cli.workers, "starting {} controller", gvk.kind);
    controller.run(source, stop).await?;
    Ok(())
}
