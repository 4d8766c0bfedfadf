//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "binary"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Binary entrypoint for the gateway driver daemon."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use fgw_common::{init_tracing, GatewayConfig};
use fgw_core::{fatal_cause, DriverRuntime, SimulatedTransportFactory};
use fgw_metrics::{new_registry, serve_metrics, DaemonMetrics};
use fgw_store::MemoryPointStore;
use tokio::signal;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "fgwd";
/// sysexits `EX_CONFIG`; supervisors should not restart on it.
const EXIT_CONFIG: u8 = 78;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Field gateway protocol driver daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Driver instance number, overrides the configuration")]
    instance: Option<u32>,

    #[arg(
        long,
        value_name = "LEVEL",
        value_parser = clap::value_parser!(u8).range(0..=3),
        help = "Log verbosity: 0 warn, 1 info, 2 debug, 3 trace"
    )]
    log_level: Option<u8>,

    #[arg(long, value_name = "NAME", help = "Node name, overrides the configuration")]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let load_started = Instant::now();
    let loaded = match &cli.config {
        Some(path) => GatewayConfig::load_file(path)?,
        None => GatewayConfig::load_with_source(&[
            PathBuf::from("conf/fgw.toml"),
            PathBuf::from("/etc/fgw/fgw.toml"),
        ])?,
    };
    let mut config = loaded.config;
    if let Some(instance) = cli.instance {
        config.driver.instance = instance;
    }
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }
    config
        .validate()
        .context("configuration invalid after command line overrides")?;
    let load_duration = load_started.elapsed();

    init_tracing(SERVICE_NAME, &config.logging, cli.log_level)?;
    info!(
        config_path = %loaded.source.display(),
        node = %config.node_name,
        protocol = %config.driver.protocol,
        instance = config.driver.instance,
        "configuration loaded"
    );

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        config.driver.protocol.driver_name(),
        config.driver.instance,
    );

    match run_daemon(config, metrics_registry).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => match fatal_cause(&err) {
            Some(cause) => {
                error!(error = %cause, "fatal driver configuration error; exiting");
                Ok(ExitCode::from(EXIT_CONFIG))
            }
            None => Err(err),
        },
    }
}

async fn run_daemon(config: GatewayConfig, registry: fgw_metrics::SharedRegistry) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(serve_metrics(registry.clone(), config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let store = Arc::new(MemoryPointStore::new());
    match &config.simulation.instance {
        Some(instance) => store.upsert_driver_instance(instance.clone()),
        None => warn!("no simulated driver instance record; node stays standby"),
    }
    for connection in &config.simulation.connections {
        store.insert_connection(connection.clone());
    }
    info!(
        connections = config.simulation.connections.len(),
        points = config.simulation.points.len(),
        "in-memory point store seeded from simulation settings"
    );

    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));
    let mut runtime = DriverRuntime::new(config.clone(), store, factory);
    if metrics_server.is_some() {
        runtime = runtime.with_metrics(registry);
    }
    let handle = runtime.start().await?;

    info!(node = %config.node_name, "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
