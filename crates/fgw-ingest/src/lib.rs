//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Ingestion pipeline from transport samples to point store writes."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Ingestion pipeline: transports push [`fgw_model::AcquiredValue`]s into a
//! bounded queue through an [`IngestHandle`]; a single [`IngestConsumer`]
//! batches them into point store writes, creating records for points seen for
//! the first time.

mod catalog;
mod consumer;
mod queue;
pub mod synth;

pub use catalog::PointCatalog;
pub use consumer::IngestConsumer;
pub use queue::{channel, IngestCounters, IngestHandle, IngestQueue, IngestSnapshot};
