//! Subprocess-backed upstream client.
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC over
//! its stdin/stdout. The child's stderr is inherited so upstream diagnostics
//! stay visible. No supervision beyond stream routing: if the child exits,
//! the next request observes the closed pipe and fails.

use crate::error::ProxyError;
use crate::protocol::{McpRequest, McpResponse, Tool, PROTOCOL_VERSION};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::UpstreamClient;

struct ChildSession {
    child: Child,
    stdin: ChildStdin,
    reader: Lines<BufReader<ChildStdout>>,
}

/// Upstream client for stdio targets.
pub struct StdioUpstreamClient {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    // Requests are serialized through this lock; response matching is by id.
    session: Mutex<Option<ChildSession>>,
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl StdioUpstreamClient {
    pub fn new(command: &str, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            env,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    async fn spawn(&self) -> Result<ChildSession, ProxyError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ProxyError::refused(
                    format!("Failed to spawn upstream command: {}", self.command),
                    e.to_string(),
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ProxyError::refused(
                "Upstream process has no stdin",
                self.command.clone(),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProxyError::refused(
                "Upstream process has no stdout",
                self.command.clone(),
            )
        })?;

        Ok(ChildSession {
            child,
            stdin,
            reader: BufReader::new(stdout).lines(),
        })
    }

    async fn write_message(
        session: &mut ChildSession,
        message: &McpRequest,
    ) -> Result<(), ProxyError> {
        let mut line = serde_json::to_string(message).map_err(|e| {
            ProxyError::invalid_response("Failed to encode request", e.to_string())
        })?;
        line.push('\n');

        session.stdin.write_all(line.as_bytes()).await.map_err(|e| {
            ProxyError::refused("Upstream process closed its stdin", e.to_string())
        })?;
        session.stdin.flush().await.map_err(|e| {
            ProxyError::refused("Upstream process closed its stdin", e.to_string())
        })
    }

    /// Read responses until one matches the request id. Server-initiated
    /// notifications and requests are skipped.
    async fn read_response(
        session: &mut ChildSession,
        id: &Value,
    ) -> Result<McpResponse, ProxyError> {
        loop {
            let line = session.reader.next_line().await.map_err(|e| {
                ProxyError::refused("Failed to read from upstream process", e.to_string())
            })?;

            let line = match line {
                Some(line) => line,
                None => {
                    return Err(ProxyError::refused(
                        "Upstream process closed its stdout",
                        String::new(),
                    ))
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<McpResponse>(line) {
                Ok(response) if response.id.as_ref() == Some(id) => return Ok(response),
                Ok(response) => {
                    debug!(id = ?response.id, "skipping unmatched upstream message");
                }
                Err(e) => {
                    debug!(error = %e, "skipping non-response line from upstream");
                }
            }
        }
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ProxyError::NotConnected)?;

        let id = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut request = McpRequest::new(method).with_id(id.clone());
        if let Some(params) = params {
            request = request.with_params(params);
        }

        Self::write_message(session, &request).await?;
        let response = Self::read_response(session, &id).await?;

        if let Some(error) = response.error {
            return Err(ProxyError::invalid_response(
                format!("{} failed: {}", method, error.message),
                format!("code {}", error.code),
            ));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl UpstreamClient for StdioUpstreamClient {
    async fn connect(&self) -> Result<(), ProxyError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ProxyError::AlreadyConnected);
        }

        let mut session = self.spawn().await?;

        // MCP initialize handshake.
        let id = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = McpRequest::new("initialize")
            .with_id(id.clone())
            .with_params(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "tool-filter-mcp",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }));

        Self::write_message(&mut session, &request).await?;
        let response = Self::read_response(&mut session, &id).await?;
        if let Some(error) = response.error {
            return Err(ProxyError::invalid_response(
                format!("Initialize failed: {}", error.message),
                format!("code {}", error.code),
            ));
        }

        let initialized = McpRequest::new("notifications/initialized");
        Self::write_message(&mut session, &initialized).await?;

        info!(command = %self.command, "connected to upstream subprocess");
        *self.session.lock().await = Some(session);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        let result = self.rpc("tools/list", None).await?;
        let tools = result.get("tools").cloned().ok_or_else(|| {
            ProxyError::invalid_response(
                "Upstream tools/list response carried no tools field",
                result.to_string(),
            )
        })?;

        serde_json::from_value(tools).map_err(|e| {
            ProxyError::invalid_response(
                "Upstream tools/list response was malformed",
                e.to_string(),
            )
        })
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ProxyError> {
        self.rpc(
            "tools/call",
            Some(json!({"name": name, "arguments": args})),
        )
        .await
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            if let Err(e) = session.child.start_kill() {
                debug!(error = %e, "upstream process already gone");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A shell one-liner standing in for an upstream server: it emits canned
    // responses for the ids the client will use (1 initialize, 2 tools/list,
    // 3 tools/call) plus a stray notification the reader must skip, then
    // sleeps so its pipes stay open for the whole session.
    fn scripted_upstream() -> StdioUpstreamClient {
        let script = concat!(
            "printf '%s\\n' ",
            "'{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"protocolVersion\":\"2024-11-05\",",
            "\"capabilities\":{},\"serverInfo\":{\"name\":\"stub\",\"version\":\"0\"}}}' ",
            "'{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}' ",
            "'{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[",
            "{\"name\":\"alpha\",\"inputSchema\":{\"type\":\"object\"}},",
            "{\"name\":\"beta\",\"inputSchema\":{\"type\":\"object\"}}]}}' ",
            "'{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}'; ",
            "sleep 5"
        );
        StdioUpstreamClient::new("sh", vec!["-c".to_string(), script.to_string()], HashMap::new())
    }

    #[tokio::test]
    async fn test_scripted_subprocess_full_session() {
        let client = scripted_upstream();

        client.connect().await.unwrap();
        assert!(client.is_connected());

        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let result = client.call_tool("alpha", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_refused_error() {
        let client = StdioUpstreamClient::new(
            "definitely-not-a-real-command-xyz",
            vec![],
            HashMap::new(),
        );

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ProxyError::Refused { .. }));
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_rpc_before_connect_fails() {
        let client = StdioUpstreamClient::new("cat", vec![], HashMap::new());
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, ProxyError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = StdioUpstreamClient::new("cat", vec![], HashMap::new());
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
