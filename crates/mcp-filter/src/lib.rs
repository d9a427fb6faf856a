//! Tool-filtering MCP proxy core.
//!
//! Sits between an MCP client and a single upstream MCP server and exposes
//! a filtered view of the upstream's tools. Filtering is by regex over tool
//! names, in deny mode (listed tools hidden) or allow mode (only listed
//! tools visible). Patterns are validated for correctness and for nested
//! unbounded repetition before any connection is attempted.
//!
//! Layers, downstream to upstream:
//! [`server::ProxyServer`] speaks JSON-RPC to the client,
//! [`proxy::ToolFilterProxy`] owns startup sequencing and the filtered tool
//! cache, [`upstream::UpstreamConnection`] enforces deadlines over one
//! session, and the [`upstream::UpstreamClient`] implementations speak the
//! actual transports (streamable HTTP, legacy SSE, stdio subprocess).

pub mod config;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod timeout;
pub mod upstream;

pub use config::{ProxyConfig, ProxyTimeouts, UpstreamTarget};
pub use error::ProxyError;
pub use filter::{
    apply_filters, validate_pattern, validate_patterns, FilterMode, FilterResult, PatternCheck,
};
pub use protocol::{JsonRpcError, McpRequest, McpResponse, Tool, PROTOCOL_VERSION};
pub use proxy::ToolFilterProxy;
pub use server::ProxyServer;
pub use upstream::{UpstreamClient, UpstreamConnection};
