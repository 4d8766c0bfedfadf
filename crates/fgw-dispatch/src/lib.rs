//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Command dispatch from the command queue to field transports."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Command dispatch: follows the command queue while this node is active,
//! validates each request, translates it into a protocol primitive and records
//! exactly one terminal outcome.

mod dispatcher;
pub mod translate;

pub use dispatcher::CommandDispatcher;
pub use translate::translate;
