//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Transport adapter contract for field devices."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed value of an OPC-UA attribute write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpcUaValue {
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

/// DNP3 control relay output block operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrobOperation {
    Nul,
    PulseOn,
    PulseOff,
    LatchOn,
    LatchOff,
}

/// DNP3 trip/close code carried by a CROB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripCloseCode {
    Nul,
    Close,
    Trip,
}

/// DNP3 analog output (group 41) value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnalogOutput {
    Int32(i32),
    Int16(i16),
    Float32(f32),
    Double64(f64),
}

/// IEC 60870-5-101 control direction information object value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IecCommandValue {
    Single(bool),
    /// Double command state, 1 = OFF, 2 = ON.
    Double(u8),
    /// Regulating step, 1 = LOWER, 2 = HIGHER.
    Step(u8),
    SetpointNormalized(i16),
    SetpointScaled(i16),
    SetpointShort(f32),
    Bitstring32(u32),
}

/// Protocol-level control action handed to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandPrimitive {
    /// Write the value attribute of an OPC-UA node.
    OpcUaWrite { node_id: String, value: OpcUaValue },
    /// DNP3 group 12 control relay output block.
    Dnp3Crob {
        index: u16,
        operation: CrobOperation,
        trip_close: TripCloseCode,
        count: u8,
        on_time_ms: u32,
        off_time_ms: u32,
    },
    /// DNP3 group 41 analog output.
    Dnp3AnalogOutput { index: u16, value: AnalogOutput },
    /// IEC 60870-5-101 command ASDU.
    Iec101 {
        common_address: u16,
        object_address: u32,
        type_id: u8,
        value: IecCommandValue,
        qualifier: u8,
        with_time_tag: bool,
    },
}

impl CommandPrimitive {
    /// Address of the controlled object, for logs.
    pub fn target(&self) -> String {
        match self {
            CommandPrimitive::OpcUaWrite { node_id, .. } => node_id.clone(),
            CommandPrimitive::Dnp3Crob { index, .. } => format!("g12/{index}"),
            CommandPrimitive::Dnp3AnalogOutput { index, .. } => format!("g41/{index}"),
            CommandPrimitive::Iec101 {
                common_address,
                object_address,
                ..
            } => format!("{common_address}/{object_address}"),
        }
    }
}

/// Device response to an execute request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Positive acknowledgement from the device.
    pub ack: bool,
    /// Protocol status rendered for operators.
    pub description: String,
}

impl CommandResponse {
    pub fn ack(description: impl Into<String>) -> Self {
        Self {
            ack: true,
            description: description.into(),
        }
    }

    pub fn nack(description: impl Into<String>) -> Self {
        Self {
            ack: false,
            description: description.into(),
        }
    }
}
