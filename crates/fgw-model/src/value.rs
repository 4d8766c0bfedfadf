//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Canonical data model shared by all protocol drivers."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PointType, COT_SPONTANEOUS};

/// Value carried by a sample. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    /// Single or double point status.
    Digital(bool),
    /// Measured or setpoint value.
    Analog(f64),
    /// Free text.
    Text(String),
    /// Structured payload (arrays, extension objects).
    Structured(Value),
    /// Marks a command-capable node discovered on the device; carries no value.
    Command,
}

impl SampleValue {
    /// Numeric rendering stored in `valueAtSource`.
    pub fn numeric(&self) -> f64 {
        match self {
            SampleValue::Digital(true) => 1.0,
            SampleValue::Digital(false) => 0.0,
            SampleValue::Analog(value) => *value,
            SampleValue::Text(text) => text.trim().parse().unwrap_or(0.0),
            SampleValue::Structured(_) | SampleValue::Command => 0.0,
        }
    }

    /// String rendering stored in `valueStringAtSource`.
    pub fn rendered(&self) -> String {
        match self {
            SampleValue::Digital(state) => state.to_string(),
            SampleValue::Analog(value) => value.to_string(),
            SampleValue::Text(text) => text.clone(),
            SampleValue::Structured(value) => value.to_string(),
            SampleValue::Command => String::new(),
        }
    }

    /// Structured rendering, present only for structured payloads.
    pub fn structured(&self) -> Option<Value> {
        match self {
            SampleValue::Structured(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Point type a first-sight record is created with.
    pub fn point_type(&self) -> PointType {
        match self {
            SampleValue::Digital(_) => PointType::Digital,
            SampleValue::Analog(_) => PointType::Analog,
            SampleValue::Text(_) => PointType::String,
            SampleValue::Structured(_) => PointType::Json,
            SampleValue::Command => PointType::Command,
        }
    }

    /// Returns `true` for command-flavored samples.
    pub fn is_command(&self) -> bool {
        matches!(self, SampleValue::Command)
    }
}

/// Quality bits reported alongside a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    /// Value is not valid.
    pub invalid: bool,
    /// Value overflowed its representation.
    pub overflow: bool,
    /// Value blocked for transmission at the source.
    pub blocked: bool,
    /// Value substituted by an operator or a proxy.
    pub substituted: bool,
    /// Counter carry.
    pub carry: bool,
    /// Transient state indication.
    pub transient: bool,
    /// Value not updated within the expected time.
    pub not_topical: bool,
}

impl Quality {
    /// Quality with every flag cleared.
    pub fn good() -> Self {
        Self::default()
    }

    /// Quality flagged invalid.
    pub fn invalid() -> Self {
        Self {
            invalid: true,
            ..Self::default()
        }
    }
}

/// Descriptive data needed to synthesize a point record for a self-published sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointMetadata {
    /// Display name reported by the device.
    pub display_name: String,
    /// Slash delimited browse path of the node.
    pub path: String,
    /// Device accepts writes (or calls) on this node.
    pub writable: bool,
    /// Access level description reported by the device.
    pub access_level: Option<String>,
    /// Requested publishing interval in seconds.
    pub publishing_interval: Option<f64>,
    /// Requested sampling interval in seconds.
    pub sampling_interval: Option<f64>,
    /// Requested monitored item queue size.
    pub queue_size: Option<u32>,
}

/// One observation of a remote point as produced by a transport adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredValue {
    /// Owning connection number.
    pub connection_number: u32,
    /// Owning connection name.
    pub connection_name: String,
    /// Protocol object address of the point.
    pub address: String,
    /// Protocol common address (ASDU address, group, namespace path).
    pub common_address: String,
    /// Protocol type tag of the sample.
    pub asdu: String,
    /// The sampled value.
    pub value: SampleValue,
    /// Value originated from an array node.
    pub is_array: bool,
    /// Quality bits.
    pub quality: Quality,
    /// Timestamp assigned by the device, if any.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Arrival timestamp at the gateway.
    pub server_timestamp: DateTime<Utc>,
    /// Cause of transmission.
    pub cause_of_transmission: u16,
    /// Spontaneous event rather than a poll result.
    pub is_event: bool,
    /// The device announces this point itself; records may need to be created.
    pub self_published: bool,
    /// Metadata used when the point record has to be synthesized.
    pub metadata: Option<PointMetadata>,
}

impl AcquiredValue {
    /// Build a spontaneous, good-quality sample received now.
    pub fn new(
        connection_number: u32,
        connection_name: impl Into<String>,
        address: impl Into<String>,
        value: SampleValue,
    ) -> Self {
        let asdu = match &value {
            SampleValue::Digital(_) => "boolean",
            SampleValue::Analog(_) => "double",
            SampleValue::Text(_) => "string",
            SampleValue::Structured(_) => "extensionobject",
            SampleValue::Command => "",
        };
        Self {
            connection_number,
            connection_name: connection_name.into(),
            address: address.into(),
            common_address: String::new(),
            asdu: asdu.to_owned(),
            value,
            is_array: false,
            quality: Quality::good(),
            source_timestamp: None,
            server_timestamp: Utc::now(),
            cause_of_transmission: COT_SPONTANEOUS,
            is_event: true,
            self_published: false,
            metadata: None,
        }
    }

    /// Attach protocol type information.
    pub fn with_asdu(mut self, asdu: impl Into<String>) -> Self {
        self.asdu = asdu.into();
        self
    }

    /// Attach the protocol common address.
    pub fn with_common_address(mut self, common_address: impl Into<String>) -> Self {
        self.common_address = common_address.into();
        self
    }

    /// Attach quality bits.
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Attach a device timestamp.
    pub fn with_source_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(timestamp);
        self
    }

    /// Mark the sample as self-published with the metadata needed to create its record.
    pub fn self_published(mut self, metadata: PointMetadata) -> Self {
        self.self_published = true;
        self.metadata = Some(metadata);
        self
    }

    /// Whether the device supplied its own timestamp.
    pub fn has_source_timestamp(&self) -> bool {
        self.source_timestamp.is_some()
    }

    /// Derive the command-flavored companion of this sample.
    pub fn as_command(&self) -> Self {
        Self {
            value: SampleValue::Command,
            is_event: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_each_variant() {
        assert_eq!(SampleValue::Digital(true).numeric(), 1.0);
        assert_eq!(SampleValue::Digital(false).rendered(), "false");
        assert_eq!(SampleValue::Analog(12.5).rendered(), "12.5");
        assert_eq!(SampleValue::Text(" 42 ".into()).numeric(), 42.0);
        assert_eq!(SampleValue::Text("on".into()).numeric(), 0.0);
        let structured = SampleValue::Structured(json!({"a": 1}));
        assert_eq!(structured.rendered(), "{\"a\":1}");
        assert_eq!(structured.structured(), Some(json!({"a": 1})));
        assert_eq!(structured.point_type(), PointType::Json);
    }

    #[test]
    fn command_companion_keeps_addressing() {
        let sample = AcquiredValue::new(3, "PLC", "ns=2;s=Valve", SampleValue::Digital(true))
            .with_common_address("Plant/Valves")
            .self_published(PointMetadata {
                display_name: "Valve".into(),
                writable: true,
                ..PointMetadata::default()
            });
        let command = sample.as_command();
        assert!(command.value.is_command());
        assert_eq!(command.address, sample.address);
        assert_eq!(command.common_address, "Plant/Valves");
        assert!(command.self_published);
        assert!(!command.is_event);
    }
}
