//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fgw_model::{ConnectionConfig, DriverInstanceRecord, Protocol};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_instance() -> u32 {
    1
}

fn default_data_buffer_limit() -> usize {
    20_000
}

fn default_bulk_write_limit() -> usize {
    1_250
}

fn default_batch_window() -> Duration {
    Duration::from_millis(750)
}

fn default_link_event_buffer() -> usize {
    64
}

fn default_store_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_unchanged_threshold() -> u32 {
    4
}

fn default_jitter_min() -> Duration {
    Duration::from_millis(1_000)
}

fn default_jitter_max() -> Duration {
    Duration::from_millis(5_000)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(3)
}

fn default_command_expiry() -> Duration {
    Duration::from_secs(10)
}

fn default_transport_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> u8 {
    1
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9_899))
}

fn default_publish_interval() -> Duration {
    Duration::from_millis(1_000)
}

/// Primary configuration object for a gateway driver process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Name of this node inside the redundancy group.
    pub node_name: String,
    pub driver: DriverConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub redundancy: RedundancyConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where a [`GatewayConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedGatewayConfig {
    pub config: GatewayConfig,
    pub source: PathBuf,
}

impl GatewayConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FGW_CONFIG";

    /// Build a configuration with defaults for every optional section.
    pub fn new(node_name: impl Into<String>, protocol: Protocol, instance: u32) -> Self {
        Self {
            node_name: node_name.into(),
            driver: DriverConfig { protocol, instance },
            pipeline: PipelineConfig::default(),
            redundancy: RedundancyConfig::default(),
            dispatch: DispatchConfig::default(),
            discovery: DiscoveryConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }

    /// Load configuration from disk, respecting the `FGW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedGatewayConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedGatewayConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedGatewayConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Load one explicitly named file; `FGW_CONFIG` and the candidates are ignored.
    pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedGatewayConfig> {
        let path = path.as_ref().to_path_buf();
        let config = Self::from_path(&path)?;
        Ok(LoadedGatewayConfig {
            config,
            source: path,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<GatewayConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(anyhow!("node_name must not be empty"));
        }
        self.pipeline.validate()?;
        self.redundancy.validate()?;
        if self.dispatch.command_expiry.is_zero() {
            return Err(anyhow!("dispatch.command_expiry must be positive"));
        }
        if self.discovery.read_batch_size == 0 {
            return Err(anyhow!("discovery.read_batch_size must be positive"));
        }
        self.simulation.validate(self.driver.protocol, self.driver.instance)?;
        Ok(())
    }
}

impl std::str::FromStr for GatewayConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: GatewayConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of the driver instance this process serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub protocol: Protocol,
    #[serde(default = "default_instance")]
    pub instance: u32,
}

/// Bounds of the ingestion queue and of each bulk write.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_buffer_limit")]
    pub data_buffer_limit: usize,
    #[serde(default = "default_bulk_write_limit")]
    pub bulk_write_limit: usize,
    #[serde(default = "default_batch_window", rename = "batch_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub batch_window: Duration,
    #[serde(default = "default_link_event_buffer")]
    pub link_event_buffer: usize,
    #[serde(default = "default_store_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub store_backoff: Duration,
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.data_buffer_limit == 0 {
            return Err(anyhow!("pipeline.data_buffer_limit must be positive"));
        }
        if self.bulk_write_limit == 0 {
            return Err(anyhow!("pipeline.bulk_write_limit must be positive"));
        }
        if self.batch_window.is_zero() {
            return Err(anyhow!("pipeline.batch_window_ms must be positive"));
        }
        if self.link_event_buffer == 0 {
            return Err(anyhow!("pipeline.link_event_buffer must be positive"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_buffer_limit: default_data_buffer_limit(),
            bulk_write_limit: default_bulk_write_limit(),
            batch_window: default_batch_window(),
            link_event_buffer: default_link_event_buffer(),
            store_backoff: default_store_backoff(),
        }
    }
}

/// Failover heuristics. None of these values are load-bearing guarantees.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    /// Consecutive unchanged peer keep-alives before self-promotion.
    #[serde(default = "default_unchanged_threshold")]
    pub unchanged_threshold: u32,
    #[serde(default = "default_jitter_min", rename = "jitter_min_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter_min: Duration,
    #[serde(default = "default_jitter_max", rename = "jitter_max_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter_max: Duration,
    #[serde(default = "default_retry_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_backoff: Duration,
}

impl RedundancyConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("redundancy.poll_interval must be positive"));
        }
        if self.unchanged_threshold == 0 {
            return Err(anyhow!("redundancy.unchanged_threshold must be at least 1"));
        }
        if self.jitter_min > self.jitter_max {
            return Err(anyhow!(
                "redundancy.jitter_min_ms must not exceed redundancy.jitter_max_ms"
            ));
        }
        Ok(())
    }
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            unchanged_threshold: default_unchanged_threshold(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_command_expiry")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_expiry: Duration,
    #[serde(default = "default_transport_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub transport_timeout: Duration,
    #[serde(default = "default_retry_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub feed_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_expiry: default_command_expiry(),
            transport_timeout: default_transport_timeout(),
            feed_backoff: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run discovery on connections flagged `auto_create_tags`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fallback read batch size for connections that leave it unset.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
}

fn default_read_batch_size() -> usize {
    100
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_batch_size: default_read_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Verbosity 0 (warn) to 3 (trace), overridden by the command line.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

/// Seeds for running against the in-memory store and simulated devices.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub instance: Option<DriverInstanceRecord>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub points: Vec<SimulatedPointConfig>,
    #[serde(default = "default_publish_interval", rename = "publish_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            instance: None,
            connections: Vec::new(),
            points: Vec::new(),
            publish_interval: default_publish_interval(),
        }
    }
}

impl SimulationConfig {
    fn validate(&self, protocol: Protocol, instance: u32) -> Result<()> {
        let mut numbers = HashSet::new();
        for connection in &self.connections {
            if !numbers.insert(connection.protocol_connection_number) {
                return Err(anyhow!(
                    "duplicate connection number {}",
                    connection.protocol_connection_number
                ));
            }
            if connection.protocol_driver != protocol
                || connection.protocol_driver_instance_number != instance
            {
                return Err(anyhow!(
                    "connection {} belongs to {} instance {}, expected {} instance {}",
                    connection.protocol_connection_number,
                    connection.protocol_driver,
                    connection.protocol_driver_instance_number,
                    protocol,
                    instance
                ));
            }
        }
        for point in &self.points {
            if !numbers.contains(&point.connection) {
                return Err(anyhow!(
                    "simulated point '{}' references unknown connection {}",
                    point.path,
                    point.connection
                ));
            }
        }
        Ok(())
    }
}

/// Kind of value a simulated point produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedPointKind {
    Digital,
    #[default]
    Analog,
    String,
}

/// Leaf node exposed by a simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPointConfig {
    pub connection: u32,
    /// Slash delimited browse path, the last segment is the display name.
    pub path: String,
    #[serde(default)]
    pub kind: SimulatedPointKind,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub initial: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new("local", Protocol::OpcUa, default_instance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
node_name = "alpha"

[driver]
protocol = "OPC-UA"
instance = 2

[pipeline]
data_buffer_limit = 500
batch_window_ms = 250

[redundancy]
poll_interval = 1
unchanged_threshold = 3

[[simulation.connections]]
protocol_driver = "OPC-UA"
protocol_driver_instance_number = 2
protocol_connection_number = 7
name = "PLC7"
commands_enabled = true

[[simulation.points]]
connection = 7
path = "Objects/Plant/Pump1/Running"
kind = "digital"
writable = true
"#;

    #[test]
    fn parses_sections_with_defaults() {
        let config: GatewayConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.driver.protocol, Protocol::OpcUa);
        assert_eq!(config.driver.instance, 2);
        assert_eq!(config.pipeline.data_buffer_limit, 500);
        assert_eq!(config.pipeline.bulk_write_limit, 1_250);
        assert_eq!(config.pipeline.batch_window, Duration::from_millis(250));
        assert_eq!(config.redundancy.poll_interval, Duration::from_secs(1));
        assert_eq!(config.redundancy.unchanged_threshold, 3);
        assert_eq!(config.redundancy.jitter_max, Duration::from_millis(5_000));
        assert_eq!(config.dispatch.command_expiry, Duration::from_secs(10));
        assert_eq!(config.simulation.connections.len(), 1);
        assert_eq!(config.simulation.points[0].kind, SimulatedPointKind::Digital);
    }

    #[test]
    fn rejects_empty_node_name() {
        let err = "node_name = \"\"\n[driver]\nprotocol = \"DNP3\"\n"
            .parse::<GatewayConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("node_name"));
    }

    #[test]
    fn rejects_points_on_unknown_connections() {
        let mut config: GatewayConfig = SAMPLE.parse().unwrap();
        config.simulation.points[0].connection = 99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_threshold() {
        let mut config = GatewayConfig::default();
        config.redundancy.unchanged_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_first_existing_candidate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let missing = PathBuf::from("does/not/exist.toml");
        let loaded =
            GatewayConfig::load_with_source(&[missing, file.path().to_path_buf()]).unwrap();
        assert_eq!(loaded.source, file.path());
        assert_eq!(loaded.config.node_name, "alpha");
    }

    #[test]
    fn explicit_file_errors_name_the_path() {
        let err = GatewayConfig::load_file("missing/fgw.toml").unwrap_err();
        assert!(format!("{err:#}").contains("missing/fgw.toml"));
    }

    #[test]
    fn reports_inspected_candidates_when_none_exist() {
        let err = GatewayConfig::load(&[PathBuf::from("nope.toml")]).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
