//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Canonical data model shared by all protocol drivers."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use thiserror::Error;

use crate::CancelReason;

/// Error taxonomy observed by every driver loop.
///
/// Only [`DriverError::Config`] raised during bootstrap terminates the process;
/// every other variant is handled where it occurs.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// Missing or invalid bootstrap configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Point store unreachable; the failing loop retries after a fixed backoff.
    #[error("point store unreachable: {0}")]
    StoreConnectivity(String),
    /// A transport lost its link; affected points are invalidated.
    #[error("transport connectivity lost on connection {connection}: {reason}")]
    TransportConnectivity {
        /// Connection number owning the transport.
        connection: u32,
        /// Human readable reason reported by the transport.
        reason: String,
    },
    /// Malformed or unsupported sample; the item is dropped.
    #[error("failed to decode sample: {0}")]
    Decode(String),
    /// Command rejected before reaching the transport.
    #[error("command rejected: {0}")]
    CommandValidation(CancelReason),
    /// Sample dropped because the ingestion queue is full or closed.
    #[error("sample dropped by the ingestion queue")]
    Backpressure,
}

impl DriverError {
    /// Returns `true` for errors that must stop the process at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Config(_))
    }

    /// Returns `true` for errors the raising loop should retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::StoreConnectivity(_) | DriverError::TransportConnectivity { .. }
        )
    }
}
