//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Bounded non-blocking sample queue fed by transports."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fgw_common::PipelineConfig;
use fgw_metrics::PipelineMetrics;
use fgw_model::{AcquiredValue, DriverError};
use fgw_transport::SampleSink;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Running totals of the ingestion pipeline.
#[derive(Debug, Default)]
pub struct IngestCounters {
    produced: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    consumed: AtomicU64,
    batches_flushed: AtomicU64,
    batches_discarded: AtomicU64,
    largest_batch: AtomicUsize,
}

impl IngestCounters {
    pub(crate) fn record_consumed(&self, count: u64) {
        self.consumed.fetch_add(count, Ordering::Relaxed);
    }

    /// Samples accepted but not yet taken by the consumer.
    pub fn queue_depth(&self) -> u64 {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        enqueued.saturating_sub(self.consumed.load(Ordering::Relaxed))
    }

    pub(crate) fn record_flush(&self, size: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.largest_batch.fetch_max(size, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.batches_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_discarded: self.batches_discarded.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    /// Samples offered by producers.
    pub produced: u64,
    /// Samples accepted into the queue.
    pub enqueued: u64,
    /// Samples lost because the queue was full or closed.
    pub dropped: u64,
    pub batches_flushed: u64,
    /// Batches thrown away while standby or after a failed write.
    pub batches_discarded: u64,
    /// Largest number of samples flushed in one batch.
    pub largest_batch: usize,
}

/// Producer side of the pipeline. Cheap to clone; one per transport is typical.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    samples: mpsc::Sender<AcquiredValue>,
    link_events: mpsc::Sender<u32>,
    counters: Arc<IngestCounters>,
    metrics: Option<PipelineMetrics>,
}

/// Consumer side of the pipeline, handed to [`crate::IngestConsumer`].
#[derive(Debug)]
pub struct IngestQueue {
    pub(crate) samples: mpsc::Receiver<AcquiredValue>,
    pub(crate) link_events: mpsc::Receiver<u32>,
    pub(crate) counters: Arc<IngestCounters>,
}

/// Create a queue bounded by `data_buffer_limit`.
pub fn channel(
    config: &PipelineConfig,
    metrics: Option<PipelineMetrics>,
) -> (IngestHandle, IngestQueue) {
    let (samples_tx, samples_rx) = mpsc::channel(config.data_buffer_limit);
    let (links_tx, links_rx) = mpsc::channel(config.link_event_buffer);
    let counters = Arc::new(IngestCounters::default());
    (
        IngestHandle {
            samples: samples_tx,
            link_events: links_tx,
            counters: counters.clone(),
            metrics,
        },
        IngestQueue {
            samples: samples_rx,
            link_events: links_rx,
            counters,
        },
    )
}

impl IngestHandle {
    /// Offer a sample without waiting. Returns `false` when it was dropped.
    pub fn enqueue(&self, sample: AcquiredValue) -> bool {
        self.try_enqueue(sample).is_ok()
    }

    /// Like [`enqueue`](Self::enqueue) but reports a drop as
    /// [`DriverError::Backpressure`]. Drops are counted, never escalated.
    pub fn try_enqueue(&self, sample: AcquiredValue) -> Result<(), DriverError> {
        self.counters.produced.fetch_add(1, Ordering::Relaxed);
        match self.samples.try_send(sample) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_enqueued();
                    metrics.set_queue_depth(self.queue_len());
                }
                Ok(())
            }
            Err(err) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped();
                }
                let reason = match err {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "queue closed",
                };
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(dropped, limit = self.capacity(), reason, "ingestion queue dropping samples");
                } else {
                    trace!(dropped, reason, "sample dropped");
                }
                Err(DriverError::Backpressure)
            }
        }
    }

    /// Samples currently waiting for the consumer.
    pub fn queue_len(&self) -> usize {
        self.samples.max_capacity() - self.samples.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.samples.max_capacity()
    }

    pub fn counters(&self) -> IngestSnapshot {
        self.counters.snapshot()
    }
}

impl SampleSink for IngestHandle {
    fn publish(&self, sample: AcquiredValue) -> bool {
        self.enqueue(sample)
    }

    fn link_down(&self, connection_number: u32) {
        if let Err(err) = self.link_events.try_send(connection_number) {
            warn!(connection = connection_number, error = %err, "link-down event not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgw_model::SampleValue;

    fn sample(idx: usize) -> AcquiredValue {
        AcquiredValue::new(1, "RTU1", idx.to_string(), SampleValue::Analog(idx as f64))
    }

    #[test]
    fn full_queue_drops_newest_and_counts_it() {
        let config = PipelineConfig {
            data_buffer_limit: 3,
            ..PipelineConfig::default()
        };
        let (handle, _queue) = channel(&config, None);
        for idx in 0..3 {
            assert!(handle.enqueue(sample(idx)));
        }
        let err = handle.try_enqueue(sample(3)).unwrap_err();
        assert_eq!(err, DriverError::Backpressure);
        assert!(!err.is_fatal() && !err.is_retryable());
        assert_eq!(handle.queue_len(), 3);
        let counters = handle.counters();
        assert_eq!(counters.produced, 4);
        assert_eq!(counters.enqueued, 3);
        assert_eq!(counters.dropped, 1);
    }

    #[test]
    fn closed_queue_counts_drops() {
        let (handle, queue) = channel(&PipelineConfig::default(), None);
        drop(queue);
        assert!(!handle.publish(sample(0)));
        assert_eq!(handle.counters().dropped, 1);
    }
}
