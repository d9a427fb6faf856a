//! Proxy core: startup sequencing and the filtered tool cache.
//!
//! Startup is strict: patterns are validated before any network activity,
//! then the upstream session is established, the tool list fetched, and the
//! filter applied. Any failure aborts startup with nothing half-initialized.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::filter::{apply_filters, validate_patterns};
use crate::protocol::Tool;
use crate::upstream::{create_client, UpstreamConnection};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Orchestrates one upstream connection and the filtered view of its tools.
pub struct ToolFilterProxy {
    config: ProxyConfig,
    connection: UpstreamConnection,
    // None until startup completes; readiness is defined by this cache.
    allowed_tools: RwLock<Option<Vec<Tool>>>,
}

impl ToolFilterProxy {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let client = create_client(&config.upstream)?;
        let connection = UpstreamConnection::new(config.identifier(), client, config.timeouts.clone());
        Ok(Self {
            config,
            connection,
            allowed_tools: RwLock::new(None),
        })
    }

    /// Validate patterns, connect, fetch the upstream tool list, and apply
    /// the filter. The proxy is ready only after this returns Ok.
    pub async fn start(&self) -> Result<(), ProxyError> {
        // Bad patterns must never cost a connection attempt.
        if !self.config.patterns.is_empty() {
            validate_patterns(&self.config.patterns)?;
        }

        self.connection.connect().await?;
        info!(upstream = %self.connection.identifier(), "connected to upstream");

        let upstream_tools = self.connection.fetch_tools().await?;
        let total = upstream_tools.len();

        let result = apply_filters(&upstream_tools, &self.config.patterns, self.config.mode)?;

        info!(
            total,
            allowed = result.allowed.len(),
            denied = result.denied.len(),
            mode = ?self.config.mode,
            "filtered upstream tools"
        );

        for pattern in &result.unmatched_patterns {
            warn!(pattern = %pattern, "pattern matched no upstream tool");
        }

        *self.allowed_tools.write().await = Some(result.allowed);
        Ok(())
    }

    /// The filtered tool list, as computed at startup.
    pub async fn tools(&self) -> Result<Vec<Tool>, ProxyError> {
        self.allowed_tools
            .read()
            .await
            .clone()
            .ok_or(ProxyError::NotReady)
    }

    /// Whether a tool survived the filter. Unknown names are treated the
    /// same as filtered ones.
    pub async fn is_allowed(&self, name: &str) -> Result<bool, ProxyError> {
        match self.allowed_tools.read().await.as_ref() {
            Some(tools) => Ok(tools.iter().any(|t| t.name == name)),
            None => Err(ProxyError::NotReady),
        }
    }

    /// Forward a call for an allowed tool. Filtered and unknown tools get
    /// the same error so the filter set is not probeable.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ProxyError> {
        if !self.is_allowed(name).await? {
            return Err(ProxyError::ToolNotFound {
                name: name.to_string(),
            });
        }
        self.connection.call_tool(name, args).await
    }

    pub async fn is_ready(&self) -> bool {
        self.allowed_tools.read().await.is_some() && self.connection.is_connected().await
    }

    /// Tear down the upstream session and drop the cached tool list.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        *self.allowed_tools.write().await = None;
    }

    pub fn connection(&self) -> &UpstreamConnection {
        &self.connection
    }
}
