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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DriverError;

/// Field protocols served by the driver core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// OPC Unified Architecture client.
    #[serde(rename = "OPC-UA")]
    OpcUa,
    /// DNP3 master.
    #[serde(rename = "DNP3")]
    Dnp3,
    /// IEC 60870-5-101 serial master.
    #[serde(rename = "IEC60870-5-101")]
    Iec101,
}

impl Protocol {
    /// Driver name as stored in `protocolDriver` fields.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Protocol::OpcUa => "OPC-UA",
            Protocol::Dnp3 => "DNP3",
            Protocol::Iec101 => "IEC60870-5-101",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver_name())
    }
}

impl FromStr for Protocol {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPC-UA" | "OPCUA" => Ok(Protocol::OpcUa),
            "DNP3" => Ok(Protocol::Dnp3),
            "IEC60870-5-101" | "IEC101" => Ok(Protocol::Iec101),
            other => Err(DriverError::Config(format!("unknown protocol driver '{other}'"))),
        }
    }
}
