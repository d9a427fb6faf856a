//! Downstream MCP server.
//!
//! Speaks newline-delimited JSON-RPC over stdio to the connecting client
//! and answers from the proxy's filtered view. Only tool calls reach the
//! upstream; everything else is served locally.

use crate::error::ProxyError;
use crate::protocol::{JsonRpcError, McpRequest, McpResponse, PROTOCOL_VERSION};
use crate::proxy::ToolFilterProxy;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

pub const SERVER_NAME: &str = "tool-filter-mcp";

/// Serves the filtered tool surface to one downstream client.
pub struct ProxyServer {
    proxy: Arc<ToolFilterProxy>,
}

impl ProxyServer {
    pub fn new(proxy: Arc<ToolFilterProxy>) -> Self {
        Self { proxy }
    }

    /// Dispatch one request. Returns None for notifications, which expect
    /// no response on the wire.
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        let id = request.id.clone();

        if request.is_notification() {
            debug!(method = %request.method, "notification received");
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => McpResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {},
                        "resources": {},
                        "prompts": {},
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
            "ping" => McpResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, request.params).await,
            // Resources and prompts are advertised but empty; reads against
            // the empty sets get empty stubs rather than protocol errors.
            "resources/list" => McpResponse::success(id, json!({"resources": []})),
            "resources/read" => McpResponse::success(id, json!({"content": ""})),
            "prompts/list" => McpResponse::success(id, json!({"prompts": []})),
            "prompts/get" => McpResponse::success(id, json!({"prompt": {}})),
            method => McpResponse::error(id, JsonRpcError::method_not_found(method)),
        };

        Some(response)
    }

    async fn handle_tools_list(&self, id: Option<Value>) -> McpResponse {
        match self.proxy.tools().await {
            Ok(tools) => McpResponse::success(id, json!({ "tools": tools })),
            Err(e) => McpResponse::error(id, JsonRpcError::internal_error(e.to_string())),
        }
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> McpResponse {
        let params = match params {
            Some(params) => params,
            None => {
                return McpResponse::error(
                    id,
                    JsonRpcError::invalid_params("tools/call requires params"),
                )
            }
        };

        let name = match params.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return McpResponse::error(
                    id,
                    JsonRpcError::invalid_params("tools/call requires a tool name"),
                )
            }
        };
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        match self.proxy.call_tool(&name, args).await {
            Ok(result) => McpResponse::success(id, result),
            Err(ProxyError::ToolNotFound { name }) => {
                warn!(tool = %name, "rejected call to filtered or unknown tool");
                McpResponse::error(id, JsonRpcError::tool_not_found(&name))
            }
            Err(e) => McpResponse::error(id, JsonRpcError::internal_error(e.to_string())),
        }
    }

    /// Serve the downstream client over stdin/stdout until EOF.
    pub async fn serve_stdio(&self) -> Result<(), ProxyError> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();

        while let Some(line) = lines.next_line().await.map_err(|e| {
            ProxyError::refused("Failed to read from stdin", e.to_string())
        })? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<McpRequest>(line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "malformed request line");
                    Some(McpResponse::error(
                        None,
                        JsonRpcError::parse_error(format!("Invalid JSON-RPC request: {}", e)),
                    ))
                }
            };

            if let Some(response) = response {
                let mut out = serde_json::to_string(&response).map_err(|e| {
                    ProxyError::invalid_response("Failed to encode response", e.to_string())
                })?;
                out.push('\n');
                stdout.write_all(out.as_bytes()).await.map_err(|e| {
                    ProxyError::refused("Failed to write to stdout", e.to_string())
                })?;
                stdout.flush().await.map_err(|e| {
                    ProxyError::refused("Failed to write to stdout", e.to_string())
                })?;
            }
        }

        debug!("stdin closed, downstream client disconnected");
        Ok(())
    }
}
