//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Primary driver runtime and lifecycle management."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Driver runtime: bootstraps the [`DriverContext`] from configuration and the
//! point store, then runs the redundancy coordinator, ingestion consumer,
//! command dispatcher and discovery tasks until shutdown.

pub mod context;
pub mod factory;
pub mod runtime;

pub use context::DriverContext;
pub use factory::{SimulatedTransportFactory, TransportFactory};
pub use runtime::{fatal_cause, DriverRuntime, RuntimeHandle};
