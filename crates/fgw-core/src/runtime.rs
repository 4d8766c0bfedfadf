//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Driver runtime startup, task wiring and shutdown."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fgw_common::GatewayConfig;
use fgw_discovery::{Discovery, DiscoveryOptions};
use fgw_dispatch::CommandDispatcher;
use fgw_ingest::{channel, IngestConsumer, IngestSnapshot};
use fgw_metrics::{DispatchMetrics, PipelineMetrics, RedundancyMetrics, SharedRegistry};
use fgw_model::{ConnectionConfig, DriverError};
use fgw_redundancy::RedundancyCoordinator;
use fgw_store::PointStore;
use fgw_transport::{LinkState, SampleSink, Transport};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::{bootstrap, DriverContext};
use crate::factory::TransportFactory;

const DISCOVERY_READY_POLL: Duration = Duration::from_secs(1);

/// Driver runtime entrypoint.
pub struct DriverRuntime {
    config: GatewayConfig,
    store: Arc<dyn PointStore>,
    factory: Arc<dyn TransportFactory>,
    metrics_registry: Option<SharedRegistry>,
}

impl DriverRuntime {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn PointStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            store,
            factory,
            metrics_registry: None,
        }
    }

    pub fn with_metrics(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Bootstrap the context and spawn every driver task.
    pub async fn start(self) -> Result<RuntimeHandle> {
        let connections = bootstrap_with_retry(&self.config, self.store.as_ref())
            .await
            .map_err(|err| anyhow!(err))
            .context("driver bootstrap failed")?;

        let pipeline_metrics = match &self.metrics_registry {
            Some(registry) => Some(PipelineMetrics::new(registry.clone())?),
            None => None,
        };
        let dispatch_metrics = match &self.metrics_registry {
            Some(registry) => Some(DispatchMetrics::new(registry.clone())?),
            None => None,
        };
        let redundancy_metrics = match &self.metrics_registry {
            Some(registry) => Some(RedundancyMetrics::new(registry.clone())?),
            None => None,
        };

        let (ingest, queue) = channel(&self.config.pipeline, pipeline_metrics.clone());
        let mut transports: Vec<Arc<dyn Transport>> = Vec::with_capacity(connections.len());
        for connection in &connections {
            let sink: Arc<dyn SampleSink> = Arc::new(ingest.clone());
            let transport = self
                .factory
                .create(connection, sink)
                .map_err(|err| anyhow!(err))
                .with_context(|| {
                    format!(
                        "failed to create transport for connection {}",
                        connection.protocol_connection_number
                    )
                })?;
            transports.push(transport);
        }

        let context = Arc::new(DriverContext::new(
            self.config.clone(),
            connections.clone(),
            transports,
            self.store.clone(),
            ingest,
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let mut coordinator = RedundancyCoordinator::new(
            self.config.driver.protocol,
            self.config.driver.instance,
            self.config.node_name.clone(),
            self.config.redundancy.clone(),
            context.store(),
            context.active().clone(),
        )
        .with_transports(context.transports());
        if let Some(metrics) = redundancy_metrics {
            coordinator = coordinator.with_metrics(metrics);
        }
        tasks.push(("redundancy", coordinator.spawn(shutdown_rx.resubscribe())));

        let mut consumer = IngestConsumer::new(
            queue,
            self.config.pipeline.clone(),
            context.store(),
            connections.clone(),
            context.catalog(),
            context.active().clone(),
        );
        if let Some(metrics) = pipeline_metrics {
            consumer = consumer.with_metrics(metrics);
        }
        tasks.push(("ingest", consumer.spawn(shutdown_rx.resubscribe())));

        let mut dispatcher = CommandDispatcher::new(
            context.store(),
            connections.clone(),
            context.transports(),
            context.active().clone(),
            self.config.dispatch.clone(),
        );
        if let Some(metrics) = dispatch_metrics {
            dispatcher = dispatcher.with_metrics(metrics);
        }
        tasks.push(("dispatch", dispatcher.spawn(shutdown_rx.resubscribe())));

        if self.config.discovery.enabled {
            for connection in connections.iter().filter(|conn| conn.auto_create_tags) {
                let handle = tokio::spawn(discovery_loop(
                    context.clone(),
                    connection.clone(),
                    shutdown_rx.resubscribe(),
                ));
                tasks.push(("discovery", handle));
            }
        }

        for handle in self.factory.spawn_workers(&shutdown_rx) {
            tasks.push(("transport", handle));
        }

        info!(
            node = %self.config.node_name,
            protocol = %self.config.driver.protocol,
            instance = self.config.driver.instance,
            connections = connections.len(),
            tasks = tasks.len(),
            "driver runtime started"
        );

        Ok(RuntimeHandle {
            context,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Handle returned from [`DriverRuntime::start`] for lifecycle control.
pub struct RuntimeHandle {
    context: Arc<DriverContext>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RuntimeHandle {
    pub fn context(&self) -> &Arc<DriverContext> {
        &self.context
    }

    pub fn is_active(&self) -> bool {
        self.context.is_active()
    }

    pub fn ingest_counters(&self) -> IngestSnapshot {
        self.context.ingest().counters()
    }

    /// Signal every task and wait for them; queued samples are flushed first.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (name, task) in self.tasks {
            task.await
                .with_context(|| format!("{name} task failed during shutdown"))?;
        }
        info!("driver runtime shutdown complete");
        Ok(())
    }
}

/// The fatal [`DriverError`] behind a failed [`DriverRuntime::start`], if any.
///
/// Callers exit on a fatal cause instead of restarting the runtime.
pub fn fatal_cause(err: &anyhow::Error) -> Option<&DriverError> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<DriverError>())
        .find(|cause| cause.is_fatal())
}

async fn bootstrap_with_retry(
    config: &GatewayConfig,
    store: &dyn PointStore,
) -> std::result::Result<Vec<ConnectionConfig>, DriverError> {
    loop {
        match bootstrap(config, store).await {
            Err(err) if err.is_retryable() => {
                warn!(
                    error = %err,
                    backoff_ms = config.redundancy.retry_backoff.as_millis() as u64,
                    "point store unreachable during bootstrap"
                );
                tokio::time::sleep(config.redundancy.retry_backoff).await;
            }
            other => return other,
        }
    }
}

/// Run one discovery pass each time the connection becomes usable: this node
/// active and the transport link up.
async fn discovery_loop(
    context: Arc<DriverContext>,
    connection: ConnectionConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let number = connection.protocol_connection_number;
    let Some(transport) = context.transport(number) else {
        error!(connection = number, "no transport for discovery");
        return;
    };
    let options = DiscoveryOptions::for_connection(&connection, &context.config().discovery);
    let mut ticker = tokio::time::interval(DISCOVERY_READY_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut explored = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        if !context.is_active() || transport.link_state() != LinkState::Up {
            explored = false;
            continue;
        }
        if explored {
            continue;
        }

        let catalog = context.catalog();
        if let Err(err) = catalog.ensure_loaded(context.store().as_ref(), number).await {
            warn!(connection = number, error = %err, "known points unavailable; discovery postponed");
            continue;
        }
        let known = catalog.known_addresses(number);
        debug!(connection = number, known = known.len(), "discovery pass starting");
        let pass = Discovery::new(connection.clone(), transport.clone(), known, options);
        let report = tokio::select! {
            _ = shutdown.recv() => break,
            report = pass.feed(context.ingest()) => report,
        };
        info!(
            connection = number,
            published = report.published,
            dropped = report.dropped,
            interrupted = report.interrupted.is_some(),
            "discovery pass finished"
        );
        // Nodes lost to a full queue or a dropped link are picked up by the next pass.
        explored = report.is_complete();
    }
    debug!(connection = number, "discovery loop shutdown");
}
