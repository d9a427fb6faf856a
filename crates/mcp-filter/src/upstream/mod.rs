//! Upstream MCP client layer.
//!
//! One logical session to the upstream server, behind a trait so the proxy
//! core never inspects transport types at runtime. Concrete variants:
//! modern streamable HTTP, legacy SSE HTTP (both in [`http`]), and a
//! subprocess-backed stdio client ([`stdio`]). The variant is selected by
//! the configuration, HTTP transport negotiation happens inside the HTTP
//! client.

pub mod connection;
pub mod http;
pub mod stdio;

use crate::config::UpstreamTarget;
use crate::error::ProxyError;
use crate::protocol::Tool;
use async_trait::async_trait;
use serde_json::Value;

pub use connection::UpstreamConnection;
pub use http::{transport_order, HttpTransportKind, HttpUpstreamClient};
pub use stdio::StdioUpstreamClient;

/// Capability set of an upstream MCP session.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Establish the session, including the MCP initialize handshake.
    async fn connect(&self) -> Result<(), ProxyError>;

    /// Fetch the upstream tool list.
    async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError>;

    /// Invoke a tool and return its result verbatim.
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ProxyError>;

    /// Tear the session down. Best effort; never fails.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Build the client variant matching the configured upstream target.
pub fn create_client(target: &UpstreamTarget) -> Result<Box<dyn UpstreamClient>, ProxyError> {
    match target {
        UpstreamTarget::Http { url, headers } => {
            Ok(Box::new(HttpUpstreamClient::new(url, headers)?))
        }
        UpstreamTarget::Stdio { command, args, env } => Ok(Box::new(StdioUpstreamClient::new(
            command,
            args.clone(),
            env.clone(),
        ))),
    }
}
