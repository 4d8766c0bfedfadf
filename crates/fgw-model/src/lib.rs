//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Canonical data model shared by all protocol drivers."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Canonical records exchanged between transports, the ingestion pipeline,
//! the command dispatcher and the point store.

mod command;
mod connection;
mod error;
mod point;
mod protocol;
mod value;

pub use command::{CancelReason, CommandOutcome, CommandRequest};
pub use connection::{ConnectionConfig, ConnectionStats, DriverInstanceRecord};
pub use error::DriverError;
pub use point::{
    key_range, point_tag, AlarmLimits, Origin, PointKey, PointRecord, PointType,
    SourceDataUpdate, POINT_KEY_RANGE,
};
pub use protocol::Protocol;
pub use value::{AcquiredValue, PointMetadata, Quality, SampleValue};

/// Cause of transmission reported for spontaneous changes.
pub const COT_SPONTANEOUS: u16 = 3;
/// Cause of transmission reported for values obtained by interrogation or browse reads.
pub const COT_INTERROGATED: u16 = 20;
