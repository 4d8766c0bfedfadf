//! ---
//! fgw_section: "03-persistence-logging"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Point store abstraction and storage bindings."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Contract between the driver core and the shared document store holding
//! connections, driver instances, realtime points and the command queue.
#![warn(missing_docs)]

use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_model::{
    CommandOutcome, CommandRequest, ConnectionConfig, ConnectionStats, DriverError,
    DriverInstanceRecord, Origin, PointKey, PointRecord, Protocol, SourceDataUpdate,
};
use futures::stream::BoxStream;
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryPointStore;

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for point store operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StoreError {
    /// The store could not be reached or rejected the request.
    #[error("point store unavailable: {0}")]
    Unavailable(String),
    /// An outcome was written for a command the store does not hold.
    #[error("command {0} not found")]
    CommandNotFound(Uuid),
    /// The command change feed ended.
    #[error("command feed closed")]
    FeedClosed,
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        DriverError::StoreConnectivity(err.to_string())
    }
}

/// One operation of a bulk write against the realtime points collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PointWrite {
    /// Create a new point record.
    Insert(Box<PointRecord>),
    /// Overwrite the source data of the supervised point at (connection, address).
    UpdateSource {
        /// Owning connection.
        connection_number: u32,
        /// Protocol object address.
        address: String,
        /// Replacement source data.
        update: SourceDataUpdate,
    },
    /// Link an existing supervised record and its command record both ways.
    LinkCommand {
        /// Supervised record key.
        supervised: PointKey,
        /// Command record key.
        command: PointKey,
    },
}

/// Addressing of a point record already present in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPoint {
    /// Surrogate key.
    pub key: PointKey,
    /// Protocol object address.
    pub address: String,
    /// Supervised or command.
    pub origin: Origin,
}

/// Counts reported by a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    /// Records inserted.
    pub inserted: usize,
    /// Records updated or linked.
    pub updated: usize,
    /// Updates that matched no record.
    pub unmatched: usize,
    /// Inserts rejected because the key or tag already existed.
    pub duplicates: usize,
}

/// Stream of command inserts observed after subscription.
pub type CommandFeed = BoxStream<'static, Result<CommandRequest>>;

/// Operations the driver core needs from the shared point store.
#[async_trait]
pub trait PointStore: Send + Sync {
    /// Cheap round-trip used to detect when the store becomes reachable again.
    async fn ping(&self) -> Result<()>;

    /// Enabled connections owned by a driver instance.
    async fn find_connections(
        &self,
        protocol: Protocol,
        instance: u32,
    ) -> Result<Vec<ConnectionConfig>>;

    /// The redundancy record of a driver instance.
    async fn find_driver_instance(
        &self,
        protocol: Protocol,
        instance: u32,
    ) -> Result<Option<DriverInstanceRecord>>;

    /// Claim or refresh the active role: writes `active_node_name` and the keep-alive.
    async fn write_heartbeat(
        &self,
        protocol: Protocol,
        instance: u32,
        node_name: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record per-connection statistics written by the active node.
    async fn update_connection_stats(
        &self,
        connection_number: u32,
        stats: &ConnectionStats,
    ) -> Result<()>;

    /// Highest existing point key inside `range`.
    async fn max_point_key_in_range(&self, range: Range<PointKey>) -> Result<Option<PointKey>>;

    /// Addresses already present for a connection, both origins.
    async fn known_points(&self, connection_number: u32) -> Result<Vec<KnownPoint>>;

    /// Apply a batch of writes in order as one request.
    async fn bulk_write(&self, writes: Vec<PointWrite>) -> Result<BulkWriteSummary>;

    /// Flag every supervised point of a connection invalid; returns the number touched.
    async fn invalidate_connection(&self, connection_number: u32, at: DateTime<Utc>)
        -> Result<u64>;

    /// Subscribe to command inserts.
    async fn watch_commands(&self) -> Result<CommandFeed>;

    /// Record the terminal outcome of a command.
    async fn update_command_outcome(
        &self,
        id: Uuid,
        outcome: &CommandOutcome,
        at: DateTime<Utc>,
    ) -> Result<()>;
}
