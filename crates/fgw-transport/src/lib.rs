//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Transport adapter contract for field devices."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Boundary between the driver core and the protocol stacks that own the
//! wire. Stacks implement [`Transport`] and push samples through a
//! [`SampleSink`]; the core never touches framing or sessions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_model::{AcquiredValue, DriverError, Quality, SampleValue};

pub mod primitive;
pub mod simulated;

pub use primitive::{
    AnalogOutput, CommandPrimitive, CommandResponse, CrobOperation, IecCommandValue, OpcUaValue,
    TripCloseCode,
};
pub use simulated::{JournalEntry, SimulatedTransport};

/// Result alias for transport calls.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors reported by transport adapters.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("connection {0} is not connected")]
    NotConnected(u32),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("device rejected request: {0}")]
    Rejected(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Classify into the driver taxonomy for the given connection.
    pub fn into_driver_error(self, connection: u32) -> DriverError {
        DriverError::TransportConnectivity {
            connection,
            reason: self.to_string(),
        }
    }
}

/// Link state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

/// Class of a node returned by a namespace browse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
    Method,
}

/// One reference returned by [`Transport::browse`].
#[derive(Debug, Clone, PartialEq)]
pub struct BrowseNode {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub class: NodeClass,
    pub has_children: bool,
    pub writable: bool,
    /// Protocol type name of the value (e.g. `double`, `boolean`).
    pub data_type: String,
    pub is_array: bool,
}

/// One page of browse results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowsePage {
    pub nodes: Vec<BrowseNode>,
    /// Token to request the next page, `None` on the last page.
    pub continuation: Option<String>,
}

/// Value read from a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReading {
    pub value: SampleValue,
    pub quality: Quality,
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// Receiver of samples and link events pushed by a transport.
///
/// Implementations must never block: transports call these from their own
/// I/O contexts.
pub trait SampleSink: Send + Sync {
    /// Offer a sample; returns `false` when it was dropped.
    fn publish(&self, sample: AcquiredValue) -> bool;

    /// Report that the link of `connection_number` went down.
    fn link_down(&self, connection_number: u32);
}

/// Protocol adapter serving one connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection served by this transport.
    fn connection_number(&self) -> u32;

    /// Current link state.
    fn link_state(&self) -> LinkState;

    /// Whether the transport is allowed to run.
    fn is_enabled(&self) -> bool;

    /// Start (or keep) talking to the device. Idempotent.
    async fn enable(&self) -> Result<()>;

    /// Stop talking to the device. Idempotent.
    async fn disable(&self) -> Result<()>;

    /// Browse the children of `parent` (the root when `None`).
    async fn browse(
        &self,
        _parent: Option<&str>,
        _continuation: Option<&str>,
        _max_nodes: u32,
    ) -> Result<BrowsePage> {
        Err(TransportError::Unsupported("browse"))
    }

    /// Read current values; the outer error fails the whole request, inner errors a single node.
    async fn read(&self, _node_ids: &[String]) -> Result<Vec<Result<NodeReading>>> {
        Err(TransportError::Unsupported("read"))
    }

    /// Select phase of select-before-operate; `Ok(true)` is a positive confirmation.
    async fn select(&self, command: &CommandPrimitive) -> Result<bool>;

    /// Operate (or direct operate) a command.
    async fn execute(&self, command: &CommandPrimitive) -> Result<CommandResponse>;
}
