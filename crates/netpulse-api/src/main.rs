//! CLI entry point for NetPulse.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use netpulse_api::{build_router, AppState};
use netpulse_core::types::{NewScanTask, TaskType};
use netpulse_core::NetPulseConfig;
use netpulse_scan::classify::DeviceClassifier;
use netpulse_scan::oui::OuiUpdater;
use netpulse_scan::worker::TaskRunner;
use netpulse_scan::{NmapInvoker, ScanPipeline, ScanScheduler, WorkerPool};
use netpulse_store::DeviceStore;

#[derive(Parser)]
#[command(name = "netpulse")]
#[command(about = "Network discovery and device inventory")]
struct Cli {
    /// Config file prefix (default: netpulse, resolving netpulse.toml).
    #[arg(long, global = true, default_value = "netpulse")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server with the scheduler and worker pool (default).
    Server {
        /// Bind host override.
        #[arg(long)]
        host: Option<String>,

        /// Bind port override.
        #[arg(long)]
        port: Option<u16>,

        /// Verbose logging.
        #[arg(long)]
        debug: bool,
    },
    /// Run a single scan and print the discovered devices.
    Scan {
        /// Scan type: discovery, quick, deep, full.
        scan_type: String,

        /// Target IP, CIDR range, or hostname.
        target: String,
    },
    /// Refresh the OUI vendor database.
    UpdateOui,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let debug = matches!(
        cli.command,
        Some(Command::Server { debug: true, .. })
    );
    init_tracing(debug);

    let mut config = NetPulseConfig::load(&cli.config).context("loading configuration")?;
    if let Some(Command::Server { host, port, .. }) = &cli.command {
        if let Some(host) = host {
            config.api.host = host.clone();
        }
        if let Some(port) = port {
            config.api.port = *port;
        }
    }
    let config = Arc::new(config);

    let store =
        Arc::new(DeviceStore::open(&config.database.path).context("opening inventory database")?);

    // Startup precondition: a missing nmap binary is fatal.
    let invoker = NmapInvoker::locate(&config.scanner)
        .await
        .context("nmap is required; install it and/or set scanner.nmap_path")?;

    match cli.command {
        None | Some(Command::Server { .. }) => run_server(config, store, invoker).await,
        Some(Command::Scan { scan_type, target }) => {
            run_scan(config, store, invoker, &scan_type, &target).await
        }
        Some(Command::UpdateOui) => run_update_oui(config, store).await,
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).json().init();
}

fn build_pipeline(
    config: &Arc<NetPulseConfig>,
    store: &Arc<DeviceStore>,
    invoker: NmapInvoker,
) -> Arc<ScanPipeline> {
    let classifier = DeviceClassifier::new(
        config.recognition.classification.clone(),
        config.alerts.rules.suspicious_port.ports.clone(),
    );
    Arc::new(ScanPipeline::new(
        invoker,
        classifier,
        store.clone(),
        config.clone(),
    ))
}

async fn refresh_oui_if_stale(config: &Arc<NetPulseConfig>, store: &Arc<DeviceStore>) {
    let updater = OuiUpdater::new(config.oui.clone(), store.clone());
    if updater.should_update() {
        match updater.update().await {
            Ok(entries) => tracing::info!(entries, "OUI database refreshed"),
            Err(e) => tracing::warn!(error = %e, "OUI update failed; using cached data"),
        }
    } else {
        tracing::info!("OUI database is up to date");
    }
}

async fn run_server(
    config: Arc<NetPulseConfig>,
    store: Arc<DeviceStore>,
    invoker: NmapInvoker,
) -> anyhow::Result<()> {
    refresh_oui_if_stale(&config, &store).await;

    let pipeline = build_pipeline(&config, &store, invoker);
    let pool = Arc::new(WorkerPool::new(
        config.scanner.workers.max_workers,
        pipeline.clone(),
    ));
    let scheduler = Arc::new(ScanScheduler::new(store.clone(), pool, config.clone()));
    scheduler
        .start()
        .await
        .context("installing default scheduled jobs")?;

    let classifier = Arc::new(DeviceClassifier::new(
        config.recognition.classification.clone(),
        config.alerts.rules.suspicious_port.ports.clone(),
    ));

    let state = AppState {
        store,
        scheduler: scheduler.clone(),
        classifier,
        config: config.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid api.host/api.port")?;
    tracing::info!(%addr, "NetPulse API listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    scheduler.shutdown().await;
    Ok(())
}

async fn run_scan(
    config: Arc<NetPulseConfig>,
    store: Arc<DeviceStore>,
    invoker: NmapInvoker,
    scan_type: &str,
    target: &str,
) -> anyhow::Result<()> {
    let scan_type: TaskType = scan_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("choose one of: discovery, quick, deep, full")?;
    if scan_type == TaskType::Custom {
        anyhow::bail!("custom scans are only available through the API");
    }

    let pipeline = build_pipeline(&config, &store, invoker);
    let task_id = store.create_task(&NewScanTask::new(scan_type, target))?;
    let task = store
        .get_task(task_id)?
        .context("created task disappeared")?;

    let outcome = pipeline.run(task).await;
    if outcome.success {
        tracing::info!(
            task_id,
            devices_found = outcome.devices_found,
            hosts_up = outcome.hosts_up,
            duration_secs = format!("{:.2}", outcome.duration),
            "Scan finished"
        );
        for device in store.list_devices(true)? {
            tracing::info!(
                ip = %device.ip_address,
                hostname = device.hostname.as_deref().unwrap_or("unknown"),
                vendor = device.vendor.as_deref().unwrap_or("unknown"),
                device_type = device.device_type.as_deref().unwrap_or("unknown"),
                "Device"
            );
        }
    } else {
        tracing::error!(
            task_id,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Scan failed"
        );
    }
    Ok(())
}

async fn run_update_oui(
    config: Arc<NetPulseConfig>,
    store: Arc<DeviceStore>,
) -> anyhow::Result<()> {
    let updater = OuiUpdater::new(config.oui.clone(), store);
    match updater.update().await {
        Ok(entries) => tracing::info!(entries, "OUI database updated"),
        Err(e) => tracing::error!(error = %e, "OUI update failed"),
    }
    Ok(())
}
