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
use serde_json::{Map, Value};

use crate::Protocol;

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_publishing_interval() -> f64 {
    5.0
}

fn default_sampling_interval() -> f64 {
    2.0
}

fn default_queue_size() -> u32 {
    10
}

fn default_read_batch_size() -> usize {
    100
}

fn default_log_level() -> u8 {
    1
}

/// Configuration of one remote device, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver serving this connection.
    pub protocol_driver: Protocol,
    /// Driver instance owning this connection.
    pub protocol_driver_instance_number: u32,
    /// Unique connection number.
    pub protocol_connection_number: u32,
    /// Connection name, used in tags and descriptions.
    pub name: String,
    /// Free text description.
    #[serde(default)]
    pub description: String,
    /// Disabled connections are not loaded.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Forward commands to the device.
    #[serde(default)]
    pub commands_enabled: bool,
    /// Device endpoints (URLs, host:port pairs, serial ports).
    #[serde(default)]
    pub endpoint_urls: Vec<String>,
    /// Local address to bind outgoing connections to.
    #[serde(default)]
    pub ip_address_local_bind: Option<String>,
    /// Transport request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Walk the device namespace and create unseen points.
    #[serde(default)]
    pub auto_create_tags: bool,
    /// Publishing interval, seconds, for auto-created points.
    #[serde(default = "default_publishing_interval")]
    pub auto_create_tags_publishing_interval: f64,
    /// Sampling interval, seconds, for auto-created points.
    #[serde(default = "default_sampling_interval")]
    pub auto_create_tags_sampling_interval: f64,
    /// Monitored item queue size for auto-created points.
    #[serde(default = "default_queue_size")]
    pub auto_create_tags_queue_size: u32,
    /// Path prefix allow-list used by discovery (empty accepts everything).
    #[serde(default)]
    pub topics: Vec<String>,
    /// Per-call browse result cap, `0` lets the device decide.
    #[serde(default)]
    pub max_nodes_per_browse: u32,
    /// Number of nodes read per discovery read request.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    /// Transport specific settings passed through untouched.
    #[serde(default)]
    pub transport: Map<String, Value>,
    /// Last statistics written by the active node.
    #[serde(default)]
    pub stats: Option<ConnectionStats>,
}

impl ConnectionConfig {
    /// Minimal enabled connection, mostly useful for seeding and tests.
    pub fn new(protocol: Protocol, instance: u32, number: u32, name: impl Into<String>) -> Self {
        Self {
            protocol_driver: protocol,
            protocol_driver_instance_number: instance,
            protocol_connection_number: number,
            name: name.into(),
            description: String::new(),
            enabled: true,
            commands_enabled: false,
            endpoint_urls: Vec::new(),
            ip_address_local_bind: None,
            timeout_ms: default_timeout_ms(),
            auto_create_tags: false,
            auto_create_tags_publishing_interval: default_publishing_interval(),
            auto_create_tags_sampling_interval: default_sampling_interval(),
            auto_create_tags_queue_size: default_queue_size(),
            topics: Vec::new(),
            max_nodes_per_browse: 0,
            read_batch_size: default_read_batch_size(),
            transport: Map::new(),
            stats: None,
        }
    }

    /// Whether `path` passes the topic allow-list.
    pub fn accepts_path(&self, path: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|topic| path.starts_with(topic.as_str()))
    }
}

/// Statistics recorded on a connection by the active node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Node that wrote the statistics.
    pub node_name: String,
    /// When the statistics were written.
    pub time_tag: DateTime<Utc>,
}

/// Shared record arbitrating the redundancy group of one driver instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInstanceRecord {
    /// Driver this instance belongs to.
    pub protocol_driver: Protocol,
    /// Instance number.
    pub protocol_driver_instance_number: u32,
    /// Disabled instances stay in standby.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requested verbosity, 0 to 3.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// Nodes allowed to run this instance (empty allows any node).
    #[serde(default)]
    pub node_names: Vec<String>,
    /// Node currently holding the active role.
    #[serde(default)]
    pub active_node_name: String,
    /// Last keep-alive written by the active node.
    #[serde(default)]
    pub active_node_keep_alive_time_tag: Option<DateTime<Utc>>,
    /// Keep transports connected while in standby.
    #[serde(default)]
    pub keep_protocol_running_while_inactive: bool,
}

impl DriverInstanceRecord {
    /// Enabled record with no active node yet.
    pub fn new(protocol: Protocol, instance: u32) -> Self {
        Self {
            protocol_driver: protocol,
            protocol_driver_instance_number: instance,
            enabled: true,
            log_level: default_log_level(),
            node_names: Vec::new(),
            active_node_name: String::new(),
            active_node_keep_alive_time_tag: None,
            keep_protocol_running_while_inactive: false,
        }
    }

    /// Whether `node` may run this instance.
    pub fn allows_node(&self, node: &str) -> bool {
        self.node_names.is_empty() || self.node_names.iter().any(|name| name == node)
    }
}
