//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Canonical data model shared by all protocol drivers."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PointKey;

/// Reason a command was cancelled before reaching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    #[serde(rename = "expired")]
    Expired,
    #[serde(rename = "not connected")]
    NotConnected,
    #[serde(rename = "commands disabled")]
    CommandsDisabled,
    #[serde(rename = "asdu not implemented")]
    AsduNotImplemented,
}

impl CancelReason {
    /// Text stored in `cancelReason`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Expired => "expired",
            CancelReason::NotConnected => "not connected",
            CancelReason::CommandsDisabled => "commands disabled",
            CancelReason::AsduNotImplemented => "asdu not implemented",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome written once per dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Rejected before any transport call.
    Cancelled { reason: CancelReason },
    /// Handed to the transport; `ack` reports the device response.
    Delivered { ack: bool, result_description: String },
}

impl CommandOutcome {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            CommandOutcome::Cancelled { reason } => reason.as_str(),
            CommandOutcome::Delivered { ack: true, .. } => "acknowledged",
            CommandOutcome::Delivered { ack: false, .. } => "rejected",
        }
    }
}

/// Control request inserted into the commands queue by an operator or application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub protocol_source_connection_number: u32,
    #[serde(default)]
    pub protocol_source_common_address: String,
    pub protocol_source_object_address: String,
    #[serde(default)]
    pub protocol_source_asdu: String,
    #[serde(default)]
    pub protocol_source_command_duration: u32,
    #[serde(default)]
    pub protocol_source_command_use_sbo: bool,
    #[serde(default)]
    pub point_key: PointKey,
    #[serde(default)]
    pub tag: String,
    pub value: f64,
    #[serde(default)]
    pub value_string: String,
    #[serde(default)]
    pub originator_user_name: String,
    #[serde(default)]
    pub originator_ip_address: String,
    /// Enqueue timestamp; commands older than the expiry window are cancelled.
    pub time_tag: DateTime<Utc>,
    #[serde(default)]
    pub delivered: Option<bool>,
    #[serde(default)]
    pub ack: Option<bool>,
    #[serde(default)]
    pub ack_time_tag: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_description: Option<String>,
    #[serde(default)]
    pub cancel_reason: Option<CancelReason>,
}

impl CommandRequest {
    /// New pending request addressed to `connection_number`/`address`.
    pub fn new(connection_number: u32, address: impl Into<String>, value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol_source_connection_number: connection_number,
            protocol_source_common_address: String::new(),
            protocol_source_object_address: address.into(),
            protocol_source_asdu: String::new(),
            protocol_source_command_duration: 0,
            protocol_source_command_use_sbo: false,
            point_key: 0,
            tag: String::new(),
            value,
            value_string: String::new(),
            originator_user_name: String::new(),
            originator_ip_address: String::new(),
            time_tag: Utc::now(),
            delivered: None,
            ack: None,
            ack_time_tag: None,
            result_description: None,
            cancel_reason: None,
        }
    }

    /// Whether a terminal outcome was already recorded.
    pub fn is_terminal(&self) -> bool {
        self.cancel_reason.is_some() || self.delivered.is_some()
    }

    /// Record the terminal outcome on this request.
    pub fn apply_outcome(&mut self, outcome: &CommandOutcome, at: DateTime<Utc>) {
        match outcome {
            CommandOutcome::Cancelled { reason } => {
                self.cancel_reason = Some(*reason);
            }
            CommandOutcome::Delivered {
                ack,
                result_description,
            } => {
                self.delivered = Some(true);
                self.ack = Some(*ack);
                self.ack_time_tag = Some(at);
                self.result_description = Some(result_description.clone());
            }
        }
    }
}
