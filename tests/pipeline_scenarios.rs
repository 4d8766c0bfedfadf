//! ---
//! fgw_section: "15-testing-qa-runbook"
//! fgw_subsection: "integration-tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Ingestion under load and overlapping discovery passes."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fgw_common::PipelineConfig;
use fgw_discovery::{Discovery, DiscoveryOptions};
use fgw_ingest::{channel, IngestConsumer, PointCatalog};
use fgw_model::{AcquiredValue, ConnectionConfig, Origin, PointMetadata, Protocol, SampleValue};
use fgw_redundancy::ActiveFlag;
use fgw_store::MemoryPointStore;
use fgw_transport::{SimulatedTransport, Transport};
use tokio::sync::broadcast;

fn connection() -> ConnectionConfig {
    ConnectionConfig::new(Protocol::OpcUa, 1, 3, "PLC3")
}

fn announced(address: &str, value: f64) -> AcquiredValue {
    AcquiredValue::new(3, "PLC3", address, SampleValue::Analog(value)).self_published(
        PointMetadata {
            display_name: address.to_owned(),
            path: address.to_owned(),
            ..PointMetadata::default()
        },
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_drops_the_overflow_and_drains_in_bounded_batches() {
    let config = PipelineConfig {
        batch_window: Duration::from_millis(20),
        ..PipelineConfig::default()
    };
    assert_eq!(config.data_buffer_limit, 20_000);
    assert_eq!(config.bulk_write_limit, 1_250);

    let (handle, queue) = channel(&config, None);
    for idx in 0..config.data_buffer_limit {
        let address = format!("Area{}/P{}", (idx % 500) / 50, idx % 500);
        assert!(handle.enqueue(announced(&address, idx as f64)));
    }
    assert!(!handle.enqueue(announced("Area0/Overflow", 0.0)));
    let counters = handle.counters();
    assert_eq!(counters.dropped, 1);
    assert_eq!(handle.queue_len(), 20_000);

    let store = Arc::new(MemoryPointStore::new());
    let active = ActiveFlag::new();
    active.set(true);
    let consumer = IngestConsumer::new(
        queue,
        config,
        store.clone(),
        vec![connection()],
        Arc::new(PointCatalog::new()),
        active,
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = consumer.spawn(shutdown_rx);

    wait_until(|| handle.queue_len() == 0).await;
    wait_until(|| store.point_count() == 500).await;
    assert!(store.point_at(3, "Area0/Overflow", Origin::Supervised).is_none());
    let sizes = store.bulk_write_sizes();
    assert!(!sizes.is_empty());
    assert!(sizes.iter().all(|size| *size <= 1_250), "batch sizes {sizes:?}");
    assert!(handle.counters().largest_batch <= 1_250);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_discovery_passes_create_each_point_once() {
    let device = Arc::new(SimulatedTransport::new(3, "PLC3"));
    for idx in 0..50 {
        device.add_variable(
            &format!("Plant/Line{}/Sensor{idx}", idx % 5),
            SampleValue::Analog(idx as f64),
            false,
        );
    }
    device.enable().await.unwrap();

    let store = Arc::new(MemoryPointStore::new());
    let active = ActiveFlag::new();
    active.set(true);
    let config = PipelineConfig {
        batch_window: Duration::from_millis(20),
        ..PipelineConfig::default()
    };
    let (handle, queue) = channel(&config, None);
    let consumer = IngestConsumer::new(
        queue,
        config,
        store.clone(),
        vec![connection()],
        Arc::new(PointCatalog::new()),
        active,
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = consumer.spawn(shutdown_rx);

    let options = DiscoveryOptions {
        read_batch_size: 7,
        max_nodes_per_browse: 4,
    };
    let first = Discovery::new(connection(), device.clone(), HashSet::new(), options);
    let second = Discovery::new(connection(), device.clone(), HashSet::new(), options);
    let (first, second) = tokio::join!(first.feed(&handle), second.feed(&handle));
    assert_eq!(first.published, 50);
    assert_eq!(second.published, 50);

    wait_until(|| handle.queue_len() == 0).await;
    wait_until(|| store.point_count() == 50).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.point_count(), 50);
    let tags: HashSet<_> = store
        .points_for_connection(3)
        .into_iter()
        .map(|record| record.tag)
        .collect();
    assert_eq!(tags.len(), 50);
    assert!(tags.contains("PLC3;Plant/Line0/Sensor0"));

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}
