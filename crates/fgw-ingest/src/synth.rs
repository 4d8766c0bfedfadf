//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Point record synthesis for self-published samples."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use fgw_model::{
    point_tag, AcquiredValue, ConnectionConfig, Origin, PointKey, PointRecord, PointType,
    SourceDataUpdate,
};

const COMMAND_TAG_SUFFIX: &str = ";cmd";

fn display_name(sample: &AcquiredValue) -> String {
    sample
        .metadata
        .as_ref()
        .map(|meta| meta.display_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| sample.address.clone())
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn base_record(
    key: PointKey,
    tag: String,
    origin: Origin,
    sample: &AcquiredValue,
    connection: &ConnectionConfig,
) -> PointRecord {
    let display = display_name(sample);
    let metadata = sample.metadata.clone().unwrap_or_default();
    let group2 = if sample.common_address.is_empty() {
        parent_path(&metadata.path).to_owned()
    } else {
        sample.common_address.clone()
    };

    let mut record = PointRecord::new(key, tag, origin);
    record.description = format!(
        "{}~{}~{}",
        connection.protocol_driver.driver_name(),
        connection.name,
        display
    );
    record.ungrouped_description = display;
    record.group1 = connection.name.clone();
    record.group2 = group2;
    record.protocol_source_connection_number = connection.protocol_connection_number;
    record.protocol_source_common_address = sample.common_address.clone();
    record.protocol_source_object_address = sample.address.clone();
    record.protocol_source_asdu = sample.asdu.clone();
    record.protocol_source_access_level = metadata.access_level;
    record.protocol_source_publishing_interval = Some(
        metadata
            .publishing_interval
            .unwrap_or(connection.auto_create_tags_publishing_interval),
    );
    record.protocol_source_sampling_interval = Some(
        metadata
            .sampling_interval
            .unwrap_or(connection.auto_create_tags_sampling_interval),
    );
    record.protocol_source_queue_size = Some(
        metadata
            .queue_size
            .unwrap_or(connection.auto_create_tags_queue_size),
    );
    record
}

fn apply_digital_texts(record: &mut PointRecord) {
    record.alarm_state = 2;
    record.state_text_true = "TRUE".to_owned();
    record.state_text_false = "FALSE".to_owned();
    record.event_text_true = "TRUE".to_owned();
    record.event_text_false = "FALSE".to_owned();
}

/// Supervised record for a sample seen for the first time.
pub fn supervised_record(
    key: PointKey,
    sample: &AcquiredValue,
    connection: &ConnectionConfig,
) -> PointRecord {
    let tag = point_tag(&connection.name, &sample.address);
    let mut record = base_record(key, tag, Origin::Supervised, sample, connection);
    record.point_type = sample.value.point_type();
    match record.point_type {
        PointType::Digital => apply_digital_texts(&mut record),
        PointType::String | PointType::Json => record.alarm_state = -1,
        PointType::Analog | PointType::Command => {}
    }
    record.value = sample.value.numeric();
    record.value_string = sample.value.rendered();
    record.time_tag = Some(sample.server_timestamp);
    record.source_data_update = Some(SourceDataUpdate::from(sample));
    record
}

/// Command type derived from the protocol type tag of the controlled node.
fn command_type(asdu: &str) -> PointType {
    match asdu.to_ascii_lowercase().as_str() {
        "boolean" => PointType::Digital,
        "string" | "datetime" => PointType::String,
        "" => PointType::Command,
        _ => PointType::Analog,
    }
}

/// Command record controlling the node the sample was taken from.
pub fn command_record(
    key: PointKey,
    sample: &AcquiredValue,
    connection: &ConnectionConfig,
) -> PointRecord {
    let tag = format!(
        "{}{COMMAND_TAG_SUFFIX}",
        point_tag(&connection.name, &sample.address)
    );
    let mut record = base_record(key, tag, Origin::Command, sample, connection);
    record.point_type = command_type(&sample.asdu);
    if record.point_type == PointType::Digital {
        apply_digital_texts(&mut record);
    }
    record
}
