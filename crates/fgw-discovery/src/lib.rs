//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Tag discovery over browsable field device namespaces."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Tag discovery: walks the namespace of a connection and produces samples for
//! nodes the point store does not know yet, so the ingestion pipeline can
//! create their records.

mod walk;

pub use walk::{Discovery, DiscoveryOptions, DiscoveryReport};
