//! MCPHub: an MCP aggregation and routing hub.
//!
//! A single process that connects out to many upstream MCP servers (C2,
//! pooled by C3), merges their tools/prompts/resources into one or more
//! scoped views (C4, optionally ranked by the smart-routing index in C5),
//! and exposes those views to downstream MCP clients (C7) over SSE and
//! streamable-HTTP (C8), with settings (C1) hot-reloadable from disk.

pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod session;
pub mod settings;
pub mod smart_index;

pub use error::{HubError, HubResult};
