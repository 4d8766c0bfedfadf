//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Batching consumer writing samples to the point store."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fgw_common::PipelineConfig;
use fgw_metrics::PipelineMetrics;
use fgw_model::{
    AcquiredValue, ConnectionConfig, DriverError, Origin, SampleValue, SourceDataUpdate,
};
use fgw_redundancy::ActiveFlag;
use fgw_store::{PointStore, PointWrite, StoreError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::PointCatalog;
use crate::queue::{IngestCounters, IngestQueue};
use crate::synth;

/// Single consumer draining the ingestion queue into bulk writes.
pub struct IngestConsumer {
    samples: mpsc::Receiver<AcquiredValue>,
    link_events: mpsc::Receiver<u32>,
    writer: BatchWriter,
}

struct BatchWriter {
    config: PipelineConfig,
    store: Arc<dyn PointStore>,
    connections: HashMap<u32, ConnectionConfig>,
    catalog: Arc<PointCatalog>,
    active: ActiveFlag,
    promotions_seen: AtomicU64,
    counters: Arc<IngestCounters>,
    metrics: Option<PipelineMetrics>,
}

impl IngestConsumer {
    pub fn new(
        queue: IngestQueue,
        config: PipelineConfig,
        store: Arc<dyn PointStore>,
        connections: impl IntoIterator<Item = ConnectionConfig>,
        catalog: Arc<PointCatalog>,
        active: ActiveFlag,
    ) -> Self {
        Self {
            samples: queue.samples,
            link_events: queue.link_events,
            writer: BatchWriter {
                config,
                store,
                connections: connections
                    .into_iter()
                    .map(|conn| (conn.protocol_connection_number, conn))
                    .collect(),
                catalog,
                promotions_seen: AtomicU64::new(active.promotions()),
                active,
                counters: queue.counters,
                metrics: None,
            },
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.writer.metrics = Some(metrics);
        self
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Batch samples until the size limit or the window closes, flush, repeat.
    /// On shutdown whatever is queued is drained and flushed before returning.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let limit = self.writer.config.bulk_write_limit;
        let window = self.writer.config.batch_window;
        let mut batch: Vec<AcquiredValue> = Vec::with_capacity(limit);
        let mut deadline: Option<Instant> = None;
        info!(limit, window_ms = window.as_millis() as u64, "ingestion consumer started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.drain(batch).await;
                    debug!("ingestion consumer shutdown");
                    break;
                }
                Some(connection) = self.link_events.recv() => {
                    self.writer.invalidate(connection).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let ready = std::mem::replace(&mut batch, Vec::with_capacity(limit));
                    if !self.writer.flush(ready).await && !self.writer.wait_for_store(&mut shutdown).await {
                        self.drain(Vec::new()).await;
                        break;
                    }
                }
                received = self.samples.recv() => {
                    let Some(sample) = received else {
                        self.drain(batch).await;
                        debug!("ingestion queue closed");
                        break;
                    };
                    self.writer.counters.record_consumed(1);
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    batch.push(sample);
                    if batch.len() >= limit {
                        deadline = None;
                        let ready = std::mem::replace(&mut batch, Vec::with_capacity(limit));
                        if !self.writer.flush(ready).await && !self.writer.wait_for_store(&mut shutdown).await {
                            self.drain(Vec::new()).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Flush `pending` plus everything still queued, in batches of at most the limit.
    async fn drain(&mut self, mut pending: Vec<AcquiredValue>) {
        let mut taken = 0;
        while let Ok(sample) = self.samples.try_recv() {
            pending.push(sample);
            taken += 1;
        }
        self.writer.counters.record_consumed(taken);
        let total = pending.len();
        let limit = self.writer.config.bulk_write_limit;
        while !pending.is_empty() {
            let rest = pending.split_off(pending.len().min(limit));
            self.writer.flush(pending).await;
            pending = rest;
        }
        if total > 0 {
            info!(flushed = total, "ingestion queue drained");
        }
    }
}

/// Reject samples that cannot be mapped onto a point record.
fn decode_check(sample: &AcquiredValue) -> Result<(), DriverError> {
    if sample.address.trim().is_empty() {
        return Err(DriverError::Decode("sample carries no object address".into()));
    }
    if let SampleValue::Analog(value) = sample.value {
        if !value.is_finite() {
            return Err(DriverError::Decode(format!(
                "non-finite analog value at {}",
                sample.address
            )));
        }
    }
    Ok(())
}

impl BatchWriter {
    /// Write one batch. Returns `false` when the store rejected it.
    async fn flush(&self, batch: Vec<AcquiredValue>) -> bool {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(self.counters.queue_depth() as usize);
        }
        if batch.is_empty() {
            return true;
        }
        if !self.active.is_active() {
            debug!(size = batch.len(), "standby; batch discarded");
            self.counters.record_discard();
            if let Some(metrics) = &self.metrics {
                metrics.record_discarded_batch();
            }
            return true;
        }
        let promotions = self.active.promotions();
        if self.promotions_seen.swap(promotions, Ordering::AcqRel) != promotions {
            info!("active role regained; point catalog reloaded from the store");
            self.catalog.reset_all();
        }

        let size = batch.len();
        let mut touched = BTreeSet::new();
        let result = match self.build_writes(&batch, &mut touched).await {
            Ok((writes, created)) => self
                .store
                .bulk_write(writes)
                .await
                .map(|summary| (summary, created)),
            Err(err) => Err(err),
        };

        match result {
            Ok((summary, created)) => {
                self.counters.record_flush(size);
                if let Some(metrics) = &self.metrics {
                    metrics.record_flush(size);
                    for origin in created {
                        metrics.record_point_created(origin);
                    }
                }
                debug!(
                    size,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    unmatched = summary.unmatched,
                    "batch flushed"
                );
                if summary.duplicates > 0 {
                    warn!(duplicates = summary.duplicates, "point inserts rejected as duplicates");
                    // Another writer took our keys; rejected addresses must be retried.
                    for connection in touched {
                        self.catalog.reset(connection);
                    }
                }
                true
            }
            Err(err) => {
                error!(size, error = %err, "bulk write failed; batch discarded");
                // Keys reserved for this batch were never stored.
                for connection in touched {
                    self.catalog.reset(connection);
                }
                self.counters.record_discard();
                if let Some(metrics) = &self.metrics {
                    metrics.record_batch_failure();
                }
                false
            }
        }
    }

    async fn build_writes(
        &self,
        batch: &[AcquiredValue],
        touched: &mut BTreeSet<u32>,
    ) -> Result<(Vec<PointWrite>, Vec<&'static str>), StoreError> {
        let mut writes = Vec::with_capacity(batch.len());
        let mut created = Vec::new();

        for sample in batch {
            let Some(connection) = self.connections.get(&sample.connection_number) else {
                warn!(connection = sample.connection_number, address = %sample.address, "sample for unknown connection dropped");
                continue;
            };
            if let Err(err) = decode_check(sample) {
                warn!(connection = sample.connection_number, error = %err, "sample dropped");
                continue;
            }
            let number = connection.protocol_connection_number;
            self.catalog
                .ensure_loaded(self.store.as_ref(), number)
                .await?;

            if sample.value.is_command() {
                if let Some(key) = self
                    .catalog
                    .allocate(number, &sample.address, Origin::Command)
                {
                    touched.insert(number);
                    let mut record = synth::command_record(key, sample, connection);
                    let supervised = self
                        .catalog
                        .lookup(number, &sample.address, Origin::Supervised);
                    if let Some(supervised) = supervised {
                        record.supervised_of_command = supervised;
                    }
                    writes.push(PointWrite::Insert(Box::new(record)));
                    created.push("command");
                    if let Some(supervised) = supervised {
                        writes.push(PointWrite::LinkCommand {
                            supervised,
                            command: key,
                        });
                    }
                }
                continue;
            }

            if sample.self_published {
                if let Some(key) = self
                    .catalog
                    .allocate(number, &sample.address, Origin::Supervised)
                {
                    touched.insert(number);
                    self.create_supervised(key, sample, connection, &mut writes, &mut created);
                }
            }

            writes.push(PointWrite::UpdateSource {
                connection_number: number,
                address: sample.address.clone(),
                update: SourceDataUpdate::from(sample),
            });
        }
        Ok((writes, created))
    }

    /// Insert a supervised record, plus a linked command companion for writable
    /// nodes on connections that accept commands.
    fn create_supervised(
        &self,
        key: u64,
        sample: &AcquiredValue,
        connection: &ConnectionConfig,
        writes: &mut Vec<PointWrite>,
        created: &mut Vec<&'static str>,
    ) {
        let number = connection.protocol_connection_number;
        let mut record = synth::supervised_record(key, sample, connection);
        let writable = sample
            .metadata
            .as_ref()
            .map(|meta| meta.writable)
            .unwrap_or(false);
        let existing_command = self
            .catalog
            .lookup(number, &sample.address, Origin::Command);

        let companion = if existing_command.is_none() && writable && connection.commands_enabled {
            self.catalog
                .allocate(number, &sample.address, Origin::Command)
                .map(|command_key| {
                    let mut command =
                        synth::command_record(command_key, &sample.as_command(), connection);
                    command.supervised_of_command = key;
                    command
                })
        } else {
            None
        };
        if let Some(command) = &companion {
            record.command_of_supervised = command.key;
        }

        writes.push(PointWrite::Insert(Box::new(record)));
        created.push("supervised");
        if let Some(command) = companion {
            writes.push(PointWrite::Insert(Box::new(command)));
            created.push("command");
        }
        if let Some(command) = existing_command {
            writes.push(PointWrite::LinkCommand {
                supervised: key,
                command,
            });
        }
    }

    /// Back off, then ping until the store answers. Returns `false` on shutdown.
    async fn wait_for_store(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return false,
                _ = tokio::time::sleep(self.config.store_backoff) => {}
            }
            match self.store.ping().await {
                Ok(()) => {
                    info!("point store reachable again; resuming ingestion");
                    return true;
                }
                Err(err) => warn!(error = %err, "point store still unreachable"),
            }
        }
    }

    async fn invalidate(&self, connection: u32) {
        if !self.active.is_active() {
            debug!(connection, "standby; link-down invalidation left to the active node");
            return;
        }
        match self.store.invalidate_connection(connection, Utc::now()).await {
            Ok(count) => {
                info!(connection, count, "link down; points invalidated");
                if let Some(metrics) = &self.metrics {
                    metrics.record_invalidation();
                }
            }
            Err(err) => {
                warn!(connection, error = %err, "failed to invalidate points after link down")
            }
        }
    }
}
