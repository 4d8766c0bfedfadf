//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Protocol command translation tables."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Translation of a queued [`CommandRequest`] into the protocol primitive the
//! transport understands. Anything the tables do not cover is rejected with
//! [`CancelReason::AsduNotImplemented`].

use chrono::{DateTime, TimeZone, Utc};
use fgw_model::{CancelReason, CommandRequest, Protocol};
use fgw_transport::{
    AnalogOutput, CommandPrimitive, CrobOperation, IecCommandValue, OpcUaValue, TripCloseCode,
};

/// DNP3 object group carrying binary output commands (CROB).
pub const DNP3_GROUP_BINARY_OUTPUT: u32 = 12;
/// DNP3 object group carrying analog output commands.
pub const DNP3_GROUP_ANALOG_OUTPUT: u32 = 41;

/// IEC 60870-5-101 command type identifiers.
pub mod iec {
    pub const C_SC_NA_1: u8 = 45;
    pub const C_DC_NA_1: u8 = 46;
    pub const C_RC_NA_1: u8 = 47;
    pub const C_SE_NA_1: u8 = 48;
    pub const C_SE_NB_1: u8 = 49;
    pub const C_SE_NC_1: u8 = 50;
    pub const C_BO_NA_1: u8 = 51;
    pub const C_SC_TA_1: u8 = 58;
    pub const C_DC_TA_1: u8 = 59;
    pub const C_RC_TA_1: u8 = 60;
    pub const C_SE_TA_1: u8 = 61;
    pub const C_SE_TB_1: u8 = 62;
    pub const C_SE_TC_1: u8 = 63;
    pub const C_BO_TA_1: u8 = 64;

    const NAMES: [(&str, u8); 14] = [
        ("C_SC_NA_1", C_SC_NA_1),
        ("C_DC_NA_1", C_DC_NA_1),
        ("C_RC_NA_1", C_RC_NA_1),
        ("C_SE_NA_1", C_SE_NA_1),
        ("C_SE_NB_1", C_SE_NB_1),
        ("C_SE_NC_1", C_SE_NC_1),
        ("C_BO_NA_1", C_BO_NA_1),
        ("C_SC_TA_1", C_SC_TA_1),
        ("C_DC_TA_1", C_DC_TA_1),
        ("C_RC_TA_1", C_RC_TA_1),
        ("C_SE_TA_1", C_SE_TA_1),
        ("C_SE_TB_1", C_SE_TB_1),
        ("C_SE_TC_1", C_SE_TC_1),
        ("C_BO_TA_1", C_BO_TA_1),
    ];

    /// Type identifier from either its mnemonic or its number.
    pub fn type_id(asdu: &str) -> Option<u8> {
        let asdu = asdu.trim();
        if let Ok(number) = asdu.parse::<u8>() {
            return Some(number);
        }
        NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(asdu))
            .map(|(_, id)| *id)
    }
}

/// Build the transport primitive for `request` on a `protocol` connection.
pub fn translate(protocol: Protocol, request: &CommandRequest) -> Result<CommandPrimitive, CancelReason> {
    match protocol {
        Protocol::OpcUa => opcua_write(request),
        Protocol::Dnp3 => dnp3_command(request),
        Protocol::Iec101 => iec101_command(request),
    }
}

fn opcua_write(request: &CommandRequest) -> Result<CommandPrimitive, CancelReason> {
    let node_id = request.protocol_source_object_address.trim();
    if node_id.is_empty() {
        return Err(CancelReason::AsduNotImplemented);
    }
    let v = request.value;
    // `as` casts saturate at the target bounds.
    let value = match request.protocol_source_asdu.trim().to_ascii_lowercase().as_str() {
        "boolean" => OpcUaValue::Boolean(v != 0.0),
        "sbyte" => OpcUaValue::SByte(v as i8),
        "byte" => OpcUaValue::Byte(v as u8),
        "int16" => OpcUaValue::Int16(v as i16),
        "uint16" => OpcUaValue::UInt16(v as u16),
        "int32" => OpcUaValue::Int32(v as i32),
        "uint32" => OpcUaValue::UInt32(v as u32),
        "int64" => OpcUaValue::Int64(v as i64),
        "uint64" => OpcUaValue::UInt64(v as u64),
        "float" => OpcUaValue::Float(v as f32),
        "double" | "" => OpcUaValue::Double(v),
        "string" => OpcUaValue::String(if request.value_string.is_empty() {
            v.to_string()
        } else {
            request.value_string.clone()
        }),
        "datetime" => OpcUaValue::DateTime(datetime_value(request)),
        _ => return Err(CancelReason::AsduNotImplemented),
    };
    Ok(CommandPrimitive::OpcUaWrite {
        node_id: node_id.to_owned(),
        value,
    })
}

/// RFC 3339 text when present, otherwise `value` as milliseconds since the epoch.
fn datetime_value(request: &CommandRequest) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(request.value_string.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
        .or_else(|| Utc.timestamp_millis_opt(request.value as i64).single())
        .unwrap_or_default()
}

fn dnp3_command(request: &CommandRequest) -> Result<CommandPrimitive, CancelReason> {
    let group = parse_number::<u32>(&request.protocol_source_common_address)?;
    let index = parse_number::<u16>(&request.protocol_source_object_address)?;
    match group {
        DNP3_GROUP_BINARY_OUTPUT => {
            let (operation, trip_close) =
                crob_code(request.protocol_source_command_duration, request.value != 0.0);
            Ok(CommandPrimitive::Dnp3Crob {
                index,
                operation,
                trip_close,
                count: 1,
                on_time_ms: 0,
                off_time_ms: 0,
            })
        }
        DNP3_GROUP_ANALOG_OUTPUT => {
            let variation = parse_number::<u32>(&request.protocol_source_asdu).unwrap_or(0);
            let v = request.value;
            let value = match variation {
                1 => AnalogOutput::Int32(v as i32),
                2 => AnalogOutput::Int16(v as i16),
                4 => AnalogOutput::Double64(v),
                _ => AnalogOutput::Float32(v as f32),
            };
            Ok(CommandPrimitive::Dnp3AnalogOutput { index, value })
        }
        _ => Err(CancelReason::AsduNotImplemented),
    }
}

/// Operation and trip/close code for a CROB. `duration` selects the pair,
/// a non-zero value picks the first member.
pub fn crob_code(duration: u32, on: bool) -> (CrobOperation, TripCloseCode) {
    use CrobOperation::*;
    use TripCloseCode::{Close, Trip};

    fn pick<T>(on: bool, first: T, second: T) -> T {
        if on {
            first
        } else {
            second
        }
    }
    match duration {
        1 => (pick(on, PulseOn, PulseOff), TripCloseCode::Nul),
        2 => (pick(on, PulseOff, PulseOn), TripCloseCode::Nul),
        3 => (pick(on, LatchOn, LatchOff), TripCloseCode::Nul),
        4 => (pick(on, LatchOff, LatchOn), TripCloseCode::Nul),
        11 => (pick(on, PulseOn, PulseOff), pick(on, Close, Trip)),
        13 => (pick(on, LatchOn, LatchOff), pick(on, Close, Trip)),
        21 => (pick(on, PulseOn, PulseOff), pick(on, Trip, Close)),
        23 => (pick(on, LatchOn, LatchOff), pick(on, Trip, Close)),
        _ => (Nul, TripCloseCode::Nul),
    }
}

fn iec101_command(request: &CommandRequest) -> Result<CommandPrimitive, CancelReason> {
    let type_id = iec::type_id(&request.protocol_source_asdu).ok_or(CancelReason::AsduNotImplemented)?;
    let common_address = parse_number::<u16>(&request.protocol_source_common_address)?;
    let object_address = parse_number::<u32>(&request.protocol_source_object_address)?;
    let v = request.value;
    let value = match type_id {
        iec::C_SC_NA_1 | iec::C_SC_TA_1 => IecCommandValue::Single(v != 0.0),
        iec::C_DC_NA_1 | iec::C_DC_TA_1 => IecCommandValue::Double(if v != 0.0 { 2 } else { 1 }),
        iec::C_RC_NA_1 | iec::C_RC_TA_1 => IecCommandValue::Step(if v >= 1.0 { 2 } else { 1 }),
        iec::C_SE_NA_1 | iec::C_SE_TA_1 => IecCommandValue::SetpointNormalized(v as i16),
        iec::C_SE_NB_1 | iec::C_SE_TB_1 => IecCommandValue::SetpointScaled(v as i16),
        iec::C_SE_NC_1 | iec::C_SE_TC_1 => IecCommandValue::SetpointShort(v as f32),
        iec::C_BO_NA_1 | iec::C_BO_TA_1 => IecCommandValue::Bitstring32(v as u32),
        _ => return Err(CancelReason::AsduNotImplemented),
    };
    Ok(CommandPrimitive::Iec101 {
        common_address,
        object_address,
        type_id,
        value,
        qualifier: request.protocol_source_command_duration.min(u8::MAX as u32) as u8,
        with_time_tag: type_id >= iec::C_SC_TA_1,
    })
}

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T, CancelReason> {
    text.trim()
        .parse::<T>()
        .map_err(|_| CancelReason::AsduNotImplemented)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(common: &str, address: &str, asdu: &str, duration: u32, value: f64) -> CommandRequest {
        let mut request = CommandRequest::new(1, address, value);
        request.protocol_source_common_address = common.into();
        request.protocol_source_asdu = asdu.into();
        request.protocol_source_command_duration = duration;
        request
    }

    #[test]
    fn crob_table_follows_duration_codes() {
        assert_eq!(crob_code(0, true), (CrobOperation::Nul, TripCloseCode::Nul));
        assert_eq!(crob_code(1, true), (CrobOperation::PulseOn, TripCloseCode::Nul));
        assert_eq!(crob_code(2, true), (CrobOperation::PulseOff, TripCloseCode::Nul));
        assert_eq!(crob_code(4, false), (CrobOperation::LatchOn, TripCloseCode::Nul));
        assert_eq!(crob_code(11, false), (CrobOperation::PulseOff, TripCloseCode::Trip));
        assert_eq!(crob_code(13, true), (CrobOperation::LatchOn, TripCloseCode::Close));
        assert_eq!(crob_code(21, true), (CrobOperation::PulseOn, TripCloseCode::Trip));
        assert_eq!(crob_code(23, false), (CrobOperation::LatchOff, TripCloseCode::Close));
        assert_eq!(crob_code(7, true), (CrobOperation::Nul, TripCloseCode::Nul));
    }

    #[test]
    fn dnp3_groups_select_primitive() {
        let crob = translate(Protocol::Dnp3, &request("12", "5", "1", 3, 1.0)).unwrap();
        assert_eq!(
            crob,
            CommandPrimitive::Dnp3Crob {
                index: 5,
                operation: CrobOperation::LatchOn,
                trip_close: TripCloseCode::Nul,
                count: 1,
                on_time_ms: 0,
                off_time_ms: 0,
            }
        );

        let analog = translate(Protocol::Dnp3, &request("41", "2", "2", 0, 70000.0)).unwrap();
        assert_eq!(
            analog,
            CommandPrimitive::Dnp3AnalogOutput {
                index: 2,
                value: AnalogOutput::Int16(i16::MAX),
            }
        );
        let fallback = translate(Protocol::Dnp3, &request("41", "2", "9", 0, 1.5)).unwrap();
        assert_eq!(
            fallback,
            CommandPrimitive::Dnp3AnalogOutput {
                index: 2,
                value: AnalogOutput::Float32(1.5),
            }
        );

        assert_eq!(
            translate(Protocol::Dnp3, &request("30", "2", "1", 0, 1.0)),
            Err(CancelReason::AsduNotImplemented)
        );
    }

    #[test]
    fn iec101_accepts_names_and_numbers() {
        let single = translate(Protocol::Iec101, &request("1", "1001", "C_SC_NA_1", 1, 1.0)).unwrap();
        assert_eq!(
            single,
            CommandPrimitive::Iec101 {
                common_address: 1,
                object_address: 1001,
                type_id: 45,
                value: IecCommandValue::Single(true),
                qualifier: 1,
                with_time_tag: false,
            }
        );

        let double = translate(Protocol::Iec101, &request("1", "7", "59", 0, 0.0)).unwrap();
        match double {
            CommandPrimitive::Iec101 {
                value,
                with_time_tag,
                ..
            } => {
                assert_eq!(value, IecCommandValue::Double(1));
                assert!(with_time_tag);
            }
            other => panic!("unexpected primitive {other:?}"),
        }

        assert_eq!(
            translate(Protocol::Iec101, &request("1", "7", "M_SP_NA_1", 0, 0.0)),
            Err(CancelReason::AsduNotImplemented)
        );
        assert_eq!(
            translate(Protocol::Iec101, &request("1", "7", "100", 0, 0.0)),
            Err(CancelReason::AsduNotImplemented)
        );
    }

    #[test]
    fn opcua_values_follow_asdu_type() {
        let write = translate(Protocol::OpcUa, &request("", "ns=2;s=Pump", "Boolean", 0, 2.0)).unwrap();
        assert_eq!(
            write,
            CommandPrimitive::OpcUaWrite {
                node_id: "ns=2;s=Pump".into(),
                value: OpcUaValue::Boolean(true),
            }
        );

        let saturated = translate(Protocol::OpcUa, &request("", "n", "byte", 0, -4.0)).unwrap();
        assert!(matches!(
            saturated,
            CommandPrimitive::OpcUaWrite {
                value: OpcUaValue::Byte(0),
                ..
            }
        ));

        let mut text = request("", "n", "string", 0, 0.0);
        text.value_string = "open".into();
        assert!(matches!(
            translate(Protocol::OpcUa, &text).unwrap(),
            CommandPrimitive::OpcUaWrite { value: OpcUaValue::String(ref s), .. } if s == "open"
        ));

        let mut stamp = request("", "n", "datetime", 0, 0.0);
        stamp.value_string = "2024-03-01T10:00:00Z".into();
        match translate(Protocol::OpcUa, &stamp).unwrap() {
            CommandPrimitive::OpcUaWrite {
                value: OpcUaValue::DateTime(at),
                ..
            } => assert_eq!(at.to_rfc3339(), "2024-03-01T10:00:00+00:00"),
            other => panic!("unexpected primitive {other:?}"),
        }

        assert_eq!(
            translate(Protocol::OpcUa, &request("", "n", "guid", 0, 0.0)),
            Err(CancelReason::AsduNotImplemented)
        );
    }
}
