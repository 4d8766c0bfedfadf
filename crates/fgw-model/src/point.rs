//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Canonical data model shared by all protocol drivers."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AcquiredValue;

/// Surrogate key of a point record.
pub type PointKey = u64;

/// Width of the key range reserved for each connection.
pub const POINT_KEY_RANGE: PointKey = 1_000_000;

/// Keys reserved for points auto-created on `connection_number`.
pub fn key_range(connection_number: u32) -> Range<PointKey> {
    let start = connection_number as PointKey * POINT_KEY_RANGE;
    start..start + POINT_KEY_RANGE
}

/// Tag assigned to auto-created points.
pub fn point_tag(connection_name: &str, address: &str) -> String {
    format!("{connection_name};{address}")
}

/// Kind of value a point record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointType {
    Digital,
    Analog,
    String,
    Json,
    Command,
}

/// Direction of a point record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Value acquired from the device.
    Supervised,
    /// Control point forwarded to the device.
    Command,
}

/// Alarm limits, unbounded by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmLimits {
    pub hi: f64,
    pub hihi: f64,
    pub hihihi: f64,
    pub lo: f64,
    pub lolo: f64,
    pub lololo: f64,
}

impl Default for AlarmLimits {
    fn default() -> Self {
        Self {
            hi: f64::MAX,
            hihi: f64::MAX,
            hihihi: f64::MAX,
            lo: -f64::MAX,
            lolo: -f64::MAX,
            lololo: -f64::MAX,
        }
    }
}

/// Latest raw observation of a point as written by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDataUpdate {
    pub value_at_source: f64,
    pub value_string_at_source: String,
    pub value_json_at_source: Option<Value>,
    pub asdu_at_source: String,
    pub cause_of_transmission_at_source: u16,
    pub time_tag_at_source: Option<DateTime<Utc>>,
    pub time_tag_at_source_ok: bool,
    pub time_tag: DateTime<Utc>,
    pub not_topical_at_source: bool,
    pub invalid_at_source: bool,
    pub overflow_at_source: bool,
    pub blocked_at_source: bool,
    pub substituted_at_source: bool,
    pub carry_at_source: bool,
    pub transient_at_source: bool,
}

impl From<&AcquiredValue> for SourceDataUpdate {
    fn from(sample: &AcquiredValue) -> Self {
        Self {
            value_at_source: sample.value.numeric(),
            value_string_at_source: sample.value.rendered(),
            value_json_at_source: sample.value.structured(),
            asdu_at_source: sample.asdu.clone(),
            cause_of_transmission_at_source: sample.cause_of_transmission,
            time_tag_at_source: sample.source_timestamp,
            time_tag_at_source_ok: sample.has_source_timestamp(),
            time_tag: sample.server_timestamp,
            not_topical_at_source: sample.quality.not_topical,
            invalid_at_source: sample.quality.invalid,
            overflow_at_source: sample.quality.overflow,
            blocked_at_source: sample.quality.blocked,
            substituted_at_source: sample.quality.substituted,
            carry_at_source: sample.quality.carry,
            transient_at_source: sample.quality.transient,
        }
    }
}

/// Canonical record of one supervised or command point.
///
/// Records are inserted once, then updated in place; they are never deleted
/// by the driver core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    #[serde(rename = "_id")]
    pub key: PointKey,
    pub tag: String,
    #[serde(rename = "type")]
    pub point_type: PointType,
    pub origin: Origin,
    pub description: String,
    pub ungrouped_description: String,
    pub group1: String,
    pub group2: String,
    pub group3: String,
    pub protocol_source_connection_number: u32,
    pub protocol_source_common_address: String,
    pub protocol_source_object_address: String,
    pub protocol_source_asdu: String,
    pub protocol_source_access_level: Option<String>,
    pub protocol_source_publishing_interval: Option<f64>,
    pub protocol_source_sampling_interval: Option<f64>,
    pub protocol_source_queue_size: Option<u32>,
    pub protocol_source_discard_oldest: bool,
    pub protocol_source_command_use_sbo: bool,
    pub protocol_source_command_duration: u32,
    /// Key of the command record controlling this supervised point, `0` when none.
    pub command_of_supervised: PointKey,
    /// Key of the supervised record this command acts on, `0` when none.
    pub supervised_of_command: PointKey,
    pub kconv1: f64,
    pub kconv2: f64,
    pub limits: AlarmLimits,
    pub invalid: bool,
    pub invalid_detect_timeout: u64,
    pub alarm_state: i32,
    pub state_text_true: String,
    pub state_text_false: String,
    pub event_text_true: String,
    pub event_text_false: String,
    pub value: f64,
    pub value_string: String,
    pub time_tag: Option<DateTime<Utc>>,
    pub source_data_update: Option<SourceDataUpdate>,
}

impl PointRecord {
    /// Empty supervised analog record with the store-wide defaults applied.
    pub fn new(key: PointKey, tag: impl Into<String>, origin: Origin) -> Self {
        Self {
            key,
            tag: tag.into(),
            point_type: PointType::Analog,
            origin,
            description: String::new(),
            ungrouped_description: String::new(),
            group1: String::new(),
            group2: String::new(),
            group3: String::new(),
            protocol_source_connection_number: 0,
            protocol_source_common_address: String::new(),
            protocol_source_object_address: String::new(),
            protocol_source_asdu: String::new(),
            protocol_source_access_level: None,
            protocol_source_publishing_interval: None,
            protocol_source_sampling_interval: None,
            protocol_source_queue_size: None,
            protocol_source_discard_oldest: true,
            protocol_source_command_use_sbo: false,
            protocol_source_command_duration: 0,
            command_of_supervised: 0,
            supervised_of_command: 0,
            kconv1: 1.0,
            kconv2: 0.0,
            limits: AlarmLimits::default(),
            invalid: true,
            invalid_detect_timeout: 60_000,
            alarm_state: -1,
            state_text_true: String::new(),
            state_text_false: String::new(),
            event_text_true: String::new(),
            event_text_false: String::new(),
            value: 0.0,
            value_string: String::new(),
            time_tag: None,
            source_data_update: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Quality, SampleValue};

    #[test]
    fn key_ranges_do_not_overlap() {
        assert_eq!(key_range(0), 0..1_000_000);
        assert_eq!(key_range(3), 3_000_000..4_000_000);
        assert_eq!(key_range(3).end, key_range(4).start);
    }

    #[test]
    fn source_update_copies_quality_and_timestamps() {
        let stamp = Utc::now();
        let sample = AcquiredValue::new(1, "RTU1", "100", SampleValue::Analog(3.5))
            .with_quality(Quality {
                overflow: true,
                ..Quality::good()
            })
            .with_source_timestamp(stamp);
        let update = SourceDataUpdate::from(&sample);
        assert_eq!(update.value_at_source, 3.5);
        assert_eq!(update.value_string_at_source, "3.5");
        assert!(update.overflow_at_source);
        assert!(!update.invalid_at_source);
        assert!(update.time_tag_at_source_ok);
        assert_eq!(update.time_tag_at_source, Some(stamp));
    }

    #[test]
    fn record_serializes_surrogate_key_as_underscore_id() {
        let record = PointRecord::new(7, "RTU1;7", Origin::Supervised);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], 7);
        assert_eq!(json["type"], "analog");
        assert_eq!(json["origin"], "supervised");
    }
}
