//! ---
//! fgw_section: "15-testing-qa-runbook"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Driver runtime lifecycle against simulated devices."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fgw_common::{GatewayConfig, SimulatedPointConfig, SimulatedPointKind};
use fgw_core::{fatal_cause, DriverRuntime, SimulatedTransportFactory};
use fgw_model::{
    CommandRequest, ConnectionConfig, DriverError, DriverInstanceRecord, Origin, Protocol,
};
use fgw_store::MemoryPointStore;
use fgw_transport::{CommandPrimitive, JournalEntry, OpcUaValue, Transport};

fn gateway_config(node: &str) -> GatewayConfig {
    let mut config = GatewayConfig::new(node, Protocol::OpcUa, 1);
    config.pipeline.batch_window = Duration::from_millis(20);
    config.simulation.publish_interval = Duration::from_millis(50);
    config.simulation.points = vec![
        SimulatedPointConfig {
            connection: 4,
            path: "Plant/Pump/Running".into(),
            kind: SimulatedPointKind::Digital,
            writable: true,
            initial: 1.0,
        },
        SimulatedPointConfig {
            connection: 4,
            path: "Plant/Tank/Level".into(),
            kind: SimulatedPointKind::Analog,
            writable: false,
            initial: 42.0,
        },
    ];
    config
}

fn seeded_store(active_node: &str, node_names: &[&str]) -> Arc<MemoryPointStore> {
    let store = Arc::new(MemoryPointStore::new());
    let mut instance = DriverInstanceRecord::new(Protocol::OpcUa, 1);
    instance.active_node_name = active_node.into();
    instance.node_names = node_names.iter().map(|name| name.to_string()).collect();
    store.upsert_driver_instance(instance);

    let mut connection = ConnectionConfig::new(Protocol::OpcUa, 1, 4, "PLC4");
    connection.commands_enabled = true;
    connection.auto_create_tags = true;
    store.insert_connection(connection);
    store
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn node_outside_allow_list_refuses_to_start() {
    let store = seeded_store("", &["beta"]);
    let config = gateway_config("alpha");
    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));

    let err = DriverRuntime::new(config, store, factory)
        .start()
        .await
        .err()
        .expect("start must fail");
    assert!(format!("{err:#}").contains("not listed"));
    assert!(matches!(fatal_cause(&err), Some(DriverError::Config(_))));
}

#[tokio::test]
async fn instance_without_connections_refuses_to_start() {
    let store = Arc::new(MemoryPointStore::new());
    let config = gateway_config("alpha");
    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));

    let err = DriverRuntime::new(config, store, factory)
        .start()
        .await
        .err()
        .expect("start must fail");
    assert!(format!("{err:#}").contains("no enabled connections"));
    assert!(fatal_cause(&err).is_some());
}

#[tokio::test]
async fn plain_errors_have_no_fatal_cause() {
    let err = anyhow::anyhow!(DriverError::StoreConnectivity("refused".into()))
        .context("driver bootstrap failed");
    assert!(fatal_cause(&err).is_none());
    assert!(fatal_cause(&anyhow::anyhow!("metrics listener busy")).is_none());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_waits_for_an_unreachable_store() {
    let store = seeded_store("alpha", &["alpha"]);
    store.set_available(false);
    let config = gateway_config("alpha");
    let backoff = config.redundancy.retry_backoff;
    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));
    let starting = DriverRuntime::new(config, store.clone(), factory).start();
    tokio::pin!(starting);

    tokio::select! {
        _ = &mut starting => panic!("runtime started without a reachable store"),
        _ = tokio::time::sleep(backoff * 3) => {}
    }

    store.set_available(true);
    let handle = starting.await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_node_ingests_and_executes_commands() {
    let store = seeded_store("alpha", &["alpha", "beta"]);
    let config = gateway_config("alpha");
    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));

    let handle = DriverRuntime::new(config, store.clone(), factory.clone())
        .start()
        .await
        .unwrap();

    wait_until(|| handle.is_active()).await;
    wait_until(|| store.point_count() == 3).await;
    let running = store
        .point_at(4, "Plant/Pump/Running", Origin::Supervised)
        .unwrap();
    let command = store
        .point_at(4, "Plant/Pump/Running", Origin::Command)
        .unwrap();
    assert_eq!(running.command_of_supervised, command.key);
    assert!(store
        .driver_instance(Protocol::OpcUa, 1)
        .and_then(|record| record.active_node_keep_alive_time_tag)
        .is_some());

    let mut request = CommandRequest::new(4, "Plant/Pump/Running", 0.0);
    request.protocol_source_asdu = "boolean".into();
    store.insert_command(request.clone());
    wait_until(|| store.outcome_writes(request.id) == 1).await;
    assert_eq!(store.command(request.id).unwrap().ack, Some(true));
    let device = factory.device(4).unwrap();
    assert!(device.journal().iter().any(|entry| matches!(
        entry,
        JournalEntry::Execute(CommandPrimitive::OpcUaWrite {
            value: OpcUaValue::Boolean(false),
            ..
        })
    )));

    // Discovery and the publisher overlap without duplicating records.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.point_count(), 3);
    assert_eq!(handle.ingest_counters().dropped, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standby_node_keeps_transports_disabled() {
    let store = seeded_store("beta", &[]);
    let config = gateway_config("alpha");
    let factory = Arc::new(SimulatedTransportFactory::new(config.simulation.clone()));

    let handle = DriverRuntime::new(config, store.clone(), factory.clone())
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!handle.is_active());
    assert!(!factory.device(4).unwrap().is_enabled());
    assert_eq!(store.point_count(), 0);
    handle.shutdown().await.unwrap();
}
