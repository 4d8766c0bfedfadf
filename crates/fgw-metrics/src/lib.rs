//! ---
//! fgw_section: "03-persistence-logging"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Metrics collection and export utilities."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Prometheus instrumentation for the driver tasks.
//!
//! Each component owns a small metric group registered on one shared
//! [`Registry`]. Groups are optional everywhere: tasks built without a
//! registry record nothing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use prometheus;

/// Registry shared by every metric group of a process.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .context("metric registration failed")?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    register(registry, IntCounter::with_opts(Opts::new(name, help))?)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    register(registry, IntCounterVec::new(Opts::new(name, help), &[label])?)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    register(registry, IntGauge::with_opts(Opts::new(name, help))?)
}

/// Serve `registry` in the Prometheus text format at `GET /metrics`.
///
/// Binding `port 0` picks an ephemeral port; see [`MetricsExporter::local_addr`].
pub async fn serve_metrics(registry: SharedRegistry, listen: SocketAddr) -> Result<MetricsExporter> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind metrics listener {listen}"))?;
    let local_addr = listener
        .local_addr()
        .context("metrics listener has no local address")?;
    let router = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await;
        if let Err(err) = &served {
            error!(error = %err, "metrics exporter stopped unexpectedly");
        }
        served.context("metrics exporter failed")
    });

    info!(address = %local_addr, "metrics exporter listening");
    Ok(MetricsExporter {
        local_addr,
        stop: Some(stop_tx),
        task,
    })
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(body) => {
            debug!(families = families.len(), "metrics scraped");
            ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], body).into_response()
        }
        Err(err) => {
            warn!(error = %err, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Running `/metrics` endpoint.
#[derive(Debug)]
pub struct MetricsExporter {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsExporter {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting scrapes and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Process level metrics of the daemon.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts: IntCounter,
    config_load: Histogram,
    build: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)?;
        Ok(Self {
            starts: counter(&registry, "fgwd_starts_total", "Daemon initialisations")?,
            config_load: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new(
                        "fgwd_config_load_seconds",
                        "Time spent loading and validating configuration",
                    )
                    .buckets(buckets),
                )?,
            )?,
            build: register(
                &registry,
                GaugeVec::new(
                    Opts::new("fgwd_build_info", "Version and driver identity of the daemon"),
                    &["version", "protocol", "instance"],
                )?,
            )?,
        })
    }

    pub fn inc_start(&self) {
        self.starts.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, protocol: &str, instance: u32) {
        let instance = instance.to_string();
        self.build
            .with_label_values(&[version, protocol, instance.as_str()])
            .set(1.0);
    }
}

/// Ingestion queue and bulk write instrumentation.
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    enqueued: IntCounter,
    dropped: IntCounter,
    queue_depth: IntGauge,
    batches_flushed: IntCounter,
    batch_size: Histogram,
    batch_failures: IntCounter,
    batches_discarded: IntCounter,
    points_created: IntCounterVec,
    invalidations: IntCounter,
}

impl PipelineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let buckets = prometheus::exponential_buckets(1.0, 2.0, 12)?;
        Ok(Self {
            enqueued: counter(
                &registry,
                "fgw_samples_enqueued_total",
                "Samples accepted into the ingestion queue",
            )?,
            dropped: counter(
                &registry,
                "fgw_samples_dropped_total",
                "Samples dropped because the ingestion queue was full",
            )?,
            queue_depth: gauge(
                &registry,
                "fgw_ingest_queue_depth",
                "Samples waiting in the ingestion queue",
            )?,
            batches_flushed: counter(
                &registry,
                "fgw_batches_flushed_total",
                "Bulk writes submitted to the point store",
            )?,
            batch_size: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new("fgw_batch_size", "Number of samples per flushed batch")
                        .buckets(buckets),
                )?,
            )?,
            batch_failures: counter(
                &registry,
                "fgw_batch_failures_total",
                "Bulk writes rejected by the point store and discarded",
            )?,
            batches_discarded: counter(
                &registry,
                "fgw_batches_discarded_standby_total",
                "Batches drained while this node was not active",
            )?,
            points_created: counter_vec(
                &registry,
                "fgw_points_created_total",
                "Point records created on first sight, by origin",
                "origin",
            )?,
            invalidations: counter(
                &registry,
                "fgw_connection_invalidations_total",
                "Link-down events that invalidated a connection's points",
            )?,
        })
    }

    pub fn record_enqueued(&self) {
        self.enqueued.inc();
    }

    pub fn record_dropped(&self) {
        self.dropped.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn record_flush(&self, size: usize) {
        self.batches_flushed.inc();
        self.batch_size.observe(size as f64);
    }

    pub fn record_batch_failure(&self) {
        self.batch_failures.inc();
    }

    pub fn record_discarded_batch(&self) {
        self.batches_discarded.inc();
    }

    pub fn record_point_created(&self, origin: &str) {
        self.points_created.with_label_values(&[origin]).inc();
    }

    pub fn record_invalidation(&self) {
        self.invalidations.inc();
    }
}

/// Command dispatcher instrumentation.
#[derive(Clone, Debug)]
pub struct DispatchMetrics {
    commands: IntCounterVec,
    ignored: IntCounterVec,
}

impl DispatchMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        Ok(Self {
            commands: counter_vec(
                &registry,
                "fgw_commands_total",
                "Commands given a terminal outcome, by outcome",
                "outcome",
            )?,
            ignored: counter_vec(
                &registry,
                "fgw_commands_ignored_total",
                "Command inserts left untouched, by reason",
                "reason",
            )?,
        })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.commands.with_label_values(&[outcome]).inc();
    }

    pub fn record_ignored(&self, reason: &str) {
        self.ignored.with_label_values(&[reason]).inc();
    }
}

/// Redundancy coordinator instrumentation.
#[derive(Clone, Debug)]
pub struct RedundancyMetrics {
    active: IntGauge,
    transitions: IntCounterVec,
    store_errors: IntCounter,
}

impl RedundancyMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        Ok(Self {
            active: gauge(
                &registry,
                "fgw_redundancy_active",
                "1 while this node holds the active role",
            )?,
            transitions: counter_vec(
                &registry,
                "fgw_failovers_total",
                "Role transitions of this node by reason",
                "reason",
            )?,
            store_errors: counter(
                &registry,
                "fgw_redundancy_store_errors_total",
                "Coordinator ticks that could not reach the point store",
            )?,
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.set(i64::from(active));
    }

    pub fn record_transition(&self, reason: &str) {
        self.transitions.with_label_values(&[reason]).inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| metric.get_counter().get_value())
                    .sum()
            })
            .unwrap_or_default()
    }

    #[test]
    fn pipeline_metrics_register_and_count() {
        let registry = new_registry();
        let metrics = PipelineMetrics::new(registry.clone()).unwrap();
        metrics.record_enqueued();
        metrics.record_enqueued();
        metrics.record_dropped();
        metrics.record_point_created("supervised");
        assert_eq!(counter_value(&registry, "fgw_samples_enqueued_total"), 2.0);
        assert_eq!(counter_value(&registry, "fgw_samples_dropped_total"), 1.0);
        assert_eq!(counter_value(&registry, "fgw_points_created_total"), 1.0);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        DispatchMetrics::new(registry.clone()).unwrap();
        assert!(DispatchMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_binds_ephemeral_port_and_shuts_down() {
        let registry = new_registry();
        RedundancyMetrics::new(registry.clone())
            .unwrap()
            .set_active(true);
        let exporter = serve_metrics(registry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(exporter.local_addr().port(), 0);
        exporter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scrape_returns_text_exposition() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = new_registry();
        RedundancyMetrics::new(registry.clone())
            .unwrap()
            .set_active(true);
        let exporter = serve_metrics(registry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(exporter.local_addr())
            .await
            .unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
        assert!(response.contains("fgw_redundancy_active 1"));
        exporter.shutdown().await.unwrap();
    }
}
