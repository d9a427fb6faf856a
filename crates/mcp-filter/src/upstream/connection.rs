//! One logical upstream session with deadline enforcement and a
//! session-lifetime tool cache.
//!
//! State machine: unconnected, connected, disconnected. Disconnected is
//! terminal; reconnecting requires a fresh instance, which rules out silent
//! double-session bugs.

use crate::config::ProxyTimeouts;
use crate::error::ProxyError;
use crate::protocol::Tool;
use crate::timeout::with_timeout;
use crate::upstream::UpstreamClient;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Unconnected,
    Connected,
    Disconnected,
}

/// Owns one session to the upstream server.
pub struct UpstreamConnection {
    identifier: String,
    client: Box<dyn UpstreamClient>,
    timeouts: ProxyTimeouts,
    state: RwLock<ConnectionState>,
    // Fetched once per session; the upstream tool set is assumed stable for
    // the life of one connection.
    tool_cache: RwLock<Option<Vec<Tool>>>,
}

impl UpstreamConnection {
    pub fn new(
        identifier: impl Into<String>,
        client: Box<dyn UpstreamClient>,
        timeouts: ProxyTimeouts,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            client,
            timeouts,
            state: RwLock::new(ConnectionState::Unconnected),
            tool_cache: RwLock::new(None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Establish the session under the configured connection deadline.
    /// Fails immediately if this instance was ever connected before.
    pub async fn connect(&self) -> Result<(), ProxyError> {
        {
            let state = self.state.read().await;
            if *state != ConnectionState::Unconnected {
                return Err(ProxyError::AlreadyConnected);
            }
        }

        debug!(upstream = %self.identifier, "connecting to upstream");
        with_timeout(
            self.client.connect(),
            self.timeouts.connect(),
            "Connection timeout",
        )
        .await?;

        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Fetch the upstream tool list, once. Later calls return the cached
    /// listing without another round-trip.
    pub async fn fetch_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        self.ensure_connected().await?;

        if let Some(cached) = self.tool_cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let tools = with_timeout(
            self.client.list_tools(),
            self.timeouts.tool_list(),
            "Tool list fetch timeout",
        )
        .await?;

        info!(
            upstream = %self.identifier,
            count = tools.len(),
            "fetched upstream tool list"
        );
        *self.tool_cache.write().await = Some(tools.clone());
        Ok(tools)
    }

    /// Forward a tool call verbatim. Intentionally unbounded at this layer:
    /// slow calls are the downstream caller's responsibility.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ProxyError> {
        self.ensure_connected().await?;
        self.client.call_tool(name, args).await
    }

    /// Close the session. Idempotent; closing an unconnected or
    /// already-closed connection is a no-op.
    pub async fn disconnect(&self) {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Connected {
            self.client.disconnect().await;
            info!(upstream = %self.identifier, "disconnected from upstream");
        }
        *state = ConnectionState::Disconnected;
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected && self.client.is_connected()
    }

    async fn ensure_connected(&self) -> Result<(), ProxyError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProxyError::NotConnected);
        }
        Ok(())
    }
}
