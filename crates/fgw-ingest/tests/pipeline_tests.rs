//! ---
//! fgw_section: "15-testing-qa-runbook"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Ingestion pipeline behaviour against the in-memory store."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fgw_common::PipelineConfig;
use fgw_ingest::{channel, IngestConsumer, IngestHandle, PointCatalog};
use fgw_model::{
    AcquiredValue, ConnectionConfig, Origin, PointMetadata, PointRecord, PointType, Protocol,
    SampleValue,
};
use fgw_redundancy::ActiveFlag;
use fgw_store::MemoryPointStore;
use fgw_transport::SampleSink;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Harness {
    store: Arc<MemoryPointStore>,
    handle: IngestHandle,
    active: ActiveFlag,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryPointStore::new());
        let mut connection = ConnectionConfig::new(Protocol::OpcUa, 1, 3, "PLC3");
        connection.commands_enabled = true;
        let (handle, queue) = channel(&config, None);
        let active = ActiveFlag::new();
        active.set(true);
        let consumer = IngestConsumer::new(
            queue,
            config,
            store.clone(),
            vec![connection],
            Arc::new(PointCatalog::new()),
            active.clone(),
        );
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = consumer.spawn(shutdown_rx);
        Self {
            store,
            handle,
            active,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> Arc<MemoryPointStore> {
        let _ = self.shutdown.send(());
        self.task.await.unwrap();
        self.store
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        batch_window: Duration::from_millis(20),
        store_backoff: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

fn discovered(address: &str, value: SampleValue, writable: bool) -> AcquiredValue {
    AcquiredValue::new(3, "PLC3", address, value).self_published(PointMetadata {
        display_name: address.rsplit('/').next().unwrap_or(address).to_owned(),
        path: address.to_owned(),
        writable,
        ..PointMetadata::default()
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_sight_creates_linked_supervised_and_command_records() {
    let harness = Harness::start(fast_config());
    assert!(harness
        .handle
        .enqueue(discovered("Objects/Valve", SampleValue::Digital(true), true)));

    let store = harness.store.clone();
    wait_until(|| store.point_count() == 2).await;

    let supervised = store.point_at(3, "Objects/Valve", Origin::Supervised).unwrap();
    let command = store.point_at(3, "Objects/Valve", Origin::Command).unwrap();
    assert_eq!(supervised.key, 3_000_000);
    assert_eq!(supervised.point_type, PointType::Digital);
    assert_eq!(supervised.command_of_supervised, command.key);
    assert_eq!(command.supervised_of_command, supervised.key);
    assert_eq!(
        supervised.source_data_update.unwrap().value_at_source,
        1.0
    );

    harness.handle.enqueue(discovered("Objects/Valve", SampleValue::Digital(false), true));
    wait_until(|| {
        store
            .point_at(3, "Objects/Valve", Origin::Supervised)
            .and_then(|record| record.source_data_update)
            .map(|update| update.value_at_source == 0.0)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(store.point_count(), 2);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_sample_links_to_existing_supervised_record() {
    let harness = Harness::start(fast_config());
    let mut existing = PointRecord::new(3_000_010, "PLC3;Objects/Setpoint", Origin::Supervised);
    existing.protocol_source_connection_number = 3;
    existing.protocol_source_object_address = "Objects/Setpoint".into();
    harness.store.insert_point(existing);

    let sample = discovered("Objects/Setpoint", SampleValue::Analog(1.0), true).as_command();
    harness.handle.enqueue(sample);

    let store = harness.store.clone();
    wait_until(|| store.point_count() == 2).await;
    let command = store.point_at(3, "Objects/Setpoint", Origin::Command).unwrap();
    assert_eq!(command.key, 3_000_011);
    assert_eq!(command.supervised_of_command, 3_000_010);
    assert_eq!(store.point(3_000_010).unwrap().command_of_supervised, 3_000_011);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_never_exceed_the_write_limit() {
    let harness = Harness::start(PipelineConfig {
        bulk_write_limit: 10,
        ..fast_config()
    });
    for idx in 0..35 {
        harness
            .handle
            .enqueue(discovered(&format!("Objects/P{idx}"), SampleValue::Analog(idx as f64), false));
    }
    let store = harness.store.clone();
    wait_until(|| store.point_count() == 35).await;
    let counters = harness.handle.counters();
    assert!(counters.largest_batch <= 10);
    assert!(counters.batches_flushed >= 4);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standby_discards_batches() {
    let harness = Harness::start(fast_config());
    harness.active.set(false);
    harness.handle.enqueue(discovered("Objects/A", SampleValue::Analog(1.0), false));

    let handle = harness.handle.clone();
    wait_until(|| handle.counters().batches_discarded == 1).await;
    assert_eq!(harness.store.point_count(), 0);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_discards_batch_and_recovers() {
    let harness = Harness::start(fast_config());
    harness.store.set_available(false);
    harness.handle.enqueue(discovered("Objects/A", SampleValue::Analog(1.0), false));
    let handle = harness.handle.clone();
    wait_until(|| handle.counters().batches_discarded == 1).await;

    harness.store.set_available(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.handle.enqueue(discovered("Objects/A", SampleValue::Analog(2.0), false));
    let store = harness.store.clone();
    wait_until(|| store.point_count() == 1).await;
    // The key reserved by the discarded batch is handed out again.
    assert!(store.point(3_000_000).is_some());
    harness.stop().await;
}

fn peer_point(key: u64, address: &str) -> PointRecord {
    let mut record = PointRecord::new(key, format!("PLC3;{address}"), Origin::Supervised);
    record.protocol_source_connection_number = 3;
    record.protocol_source_object_address = address.to_owned();
    record
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn regaining_active_role_reloads_keys_created_by_peer() {
    let harness = Harness::start(fast_config());
    harness.handle.enqueue(discovered("Objects/A", SampleValue::Analog(1.0), false));
    let store = harness.store.clone();
    wait_until(|| store.point_count() == 1).await;
    assert_eq!(store.point_at(3, "Objects/A", Origin::Supervised).unwrap().key, 3_000_000);

    // While standby the peer allocates the next key of the shared range.
    harness.active.set(false);
    assert!(store.insert_point(peer_point(3_000_001, "Objects/B")));
    harness.active.set(true);

    harness.handle.enqueue(discovered("Objects/C", SampleValue::Analog(2.0), false));
    harness.handle.enqueue(discovered("Objects/C", SampleValue::Analog(3.0), false));
    wait_until(|| {
        store
            .point_at(3, "Objects/C", Origin::Supervised)
            .and_then(|record| record.source_data_update)
            .map(|update| update.value_at_source == 3.0)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(store.point_at(3, "Objects/C", Origin::Supervised).unwrap().key, 3_000_002);
    assert_eq!(store.point_count(), 3);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_key_rejection_retries_creation_with_fresh_catalog() {
    let harness = Harness::start(fast_config());
    harness.handle.enqueue(discovered("Objects/A", SampleValue::Analog(1.0), false));
    let store = harness.store.clone();
    wait_until(|| store.point_count() == 1).await;

    // Key taken behind the consumer's back without a role change.
    assert!(store.insert_point(peer_point(3_000_001, "Objects/B")));
    harness.handle.enqueue(discovered("Objects/C", SampleValue::Analog(2.0), false));
    let handle = harness.handle.clone();
    wait_until(|| handle.counters().batches_flushed >= 2).await;
    assert!(store.point_at(3, "Objects/C", Origin::Supervised).is_none());

    harness.handle.enqueue(discovered("Objects/C", SampleValue::Analog(3.0), false));
    wait_until(|| store.point_at(3, "Objects/C", Origin::Supervised).is_some()).await;
    assert_eq!(store.point_at(3, "Objects/C", Origin::Supervised).unwrap().key, 3_000_002);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_samples_are_dropped_without_stalling_the_batch() {
    let harness = Harness::start(fast_config());
    harness.handle.enqueue(discovered("", SampleValue::Analog(1.0), false));
    harness.handle.enqueue(discovered("Objects/Nan", SampleValue::Analog(f64::NAN), false));
    harness.handle.enqueue(discovered("Objects/Ok", SampleValue::Analog(5.0), false));

    let store = harness.store.clone();
    wait_until(|| store.point_count() == 1).await;
    assert!(store.point_at(3, "Objects/Ok", Origin::Supervised).is_some());
    assert!(store.point_at(3, "Objects/Nan", Origin::Supervised).is_none());
    assert_eq!(harness.handle.counters().batches_discarded, 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn partial_batch_is_written_when_the_window_closes() {
    let config = PipelineConfig {
        bulk_write_limit: 10,
        ..PipelineConfig::default()
    };
    let window = config.batch_window;
    let harness = Harness::start(config);
    for idx in 0..3 {
        harness
            .handle
            .enqueue(discovered(&format!("Objects/W{idx}"), SampleValue::Analog(0.0), false));
    }

    tokio::time::sleep(window - Duration::from_millis(10)).await;
    assert!(harness.store.bulk_write_sizes().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.store.bulk_write_sizes().len(), 1);
    assert_eq!(harness.store.point_count(), 3);
    assert_eq!(harness.handle.counters().batches_flushed, 1);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_down_invalidates_connection_points() {
    let harness = Harness::start(fast_config());
    let mut record = PointRecord::new(3_000_000, "PLC3;A", Origin::Supervised);
    record.protocol_source_connection_number = 3;
    record.invalid = false;
    harness.store.insert_point(record);

    harness.handle.link_down(3);
    let store = harness.store.clone();
    wait_until(|| store.point(3_000_000).map(|p| p.invalid).unwrap_or(false)).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_queued_samples() {
    let harness = Harness::start(PipelineConfig {
        batch_window: Duration::from_secs(30),
        ..fast_config()
    });
    for idx in 0..5 {
        harness
            .handle
            .enqueue(discovered(&format!("Objects/Q{idx}"), SampleValue::Analog(0.0), false));
    }
    let store = harness.stop().await;
    assert_eq!(store.point_count(), 5);
}
