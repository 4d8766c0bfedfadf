//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Shared primitives for the gateway workspace: configuration loading,
//! tracing initialisation and time helpers.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    DispatchConfig, DiscoveryConfig, DriverConfig, GatewayConfig, LoadedGatewayConfig,
    LoggingConfig, MetricsConfig, PipelineConfig, RedundancyConfig, SimulatedPointConfig,
    SimulatedPointKind, SimulationConfig,
};
pub use logging::{init_tracing, verbosity_directive, LogFormat};
