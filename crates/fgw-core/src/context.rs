//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared driver context and startup bootstrap."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use fgw_common::GatewayConfig;
use fgw_ingest::{IngestHandle, PointCatalog};
use fgw_model::{ConnectionConfig, DriverError};
use fgw_redundancy::ActiveFlag;
use fgw_store::PointStore;
use fgw_transport::Transport;
use tracing::{info, warn};

/// Everything the driver tasks share: configuration, the connections of this
/// instance with their transports, the point store and the active flag.
pub struct DriverContext {
    config: GatewayConfig,
    connections: Vec<ConnectionConfig>,
    transports: HashMap<u32, Arc<dyn Transport>>,
    store: Arc<dyn PointStore>,
    active: ActiveFlag,
    catalog: Arc<PointCatalog>,
    ingest: IngestHandle,
}

impl DriverContext {
    pub fn new(
        config: GatewayConfig,
        connections: Vec<ConnectionConfig>,
        transports: Vec<Arc<dyn Transport>>,
        store: Arc<dyn PointStore>,
        ingest: IngestHandle,
    ) -> Self {
        Self {
            config,
            connections,
            transports: transports
                .into_iter()
                .map(|transport| (transport.connection_number(), transport))
                .collect(),
            store,
            active: ActiveFlag::new(),
            catalog: Arc::new(PointCatalog::new()),
            ingest,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn connections(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    pub fn connection(&self, number: u32) -> Option<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|conn| conn.protocol_connection_number == number)
    }

    pub fn transport(&self, number: u32) -> Option<Arc<dyn Transport>> {
        self.transports.get(&number).cloned()
    }

    /// Transports in connection order.
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.connections
            .iter()
            .filter_map(|conn| self.transport(conn.protocol_connection_number))
            .collect()
    }

    pub fn store(&self) -> Arc<dyn PointStore> {
        Arc::clone(&self.store)
    }

    pub fn active(&self) -> &ActiveFlag {
        &self.active
    }

    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    pub fn catalog(&self) -> Arc<PointCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn ingest(&self) -> &IngestHandle {
        &self.ingest
    }
}

/// Resolve the connections this node serves.
///
/// Fails with [`DriverError::Config`] when the instance record names allowed
/// nodes and this node is not one of them, or when the instance owns no
/// enabled connection. Store failures surface as
/// [`DriverError::StoreConnectivity`] so the caller can retry.
pub async fn bootstrap(
    config: &GatewayConfig,
    store: &dyn PointStore,
) -> Result<Vec<ConnectionConfig>, DriverError> {
    let protocol = config.driver.protocol;
    let instance = config.driver.instance;

    match store.find_driver_instance(protocol, instance).await? {
        Some(record) => {
            if !record.allows_node(&config.node_name) {
                return Err(DriverError::Config(format!(
                    "node '{}' is not listed in the node names of {} instance {}",
                    config.node_name, protocol, instance
                )));
            }
            info!(
                protocol = %protocol,
                instance,
                enabled = record.enabled,
                "driver instance record found"
            );
        }
        None => warn!(
            protocol = %protocol,
            instance,
            "driver instance record missing; node stays standby until it appears"
        ),
    }

    let connections = store.find_connections(protocol, instance).await?;
    if connections.is_empty() {
        return Err(DriverError::Config(format!(
            "no enabled connections for {protocol} instance {instance}"
        )));
    }
    for connection in &connections {
        info!(
            connection = connection.protocol_connection_number,
            name = %connection.name,
            commands_enabled = connection.commands_enabled,
            auto_create_tags = connection.auto_create_tags,
            "connection loaded"
        );
    }
    Ok(connections)
}
