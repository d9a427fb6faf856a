//! HTTP upstream client with transport negotiation.
//!
//! Two wire transports exist for HTTP MCP servers: the modern streamable
//! transport (JSON-RPC POST to the server URL, session tracked via the
//! `Mcp-Session-Id` header) and the legacy SSE transport (JSON-RPC POST to
//! `{url}/message`, responses possibly framed as `text/event-stream`).
//!
//! The negotiator picks a deterministic trial order from the URL path and
//! attempts each candidate with a fresh session. A failed streamable attempt
//! falls back to SSE only on a method-not-allowed signature; a failed SSE
//! attempt falls back to streamable whenever one remains. A 405 on the last
//! candidate is surfaced with the methods the upstream does support,
//! recovered first from the `Allow` header captured during the failed
//! attempt, then from an OPTIONS/HEAD probe.

use crate::error::ProxyError;
use crate::protocol::{McpRequest, McpResponse, Tool, PROTOCOL_VERSION};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::UpstreamClient;

/// Client identity sent in the MCP initialize handshake.
const CLIENT_NAME: &str = "tool-filter-mcp";

/// HTTP wire transport kinds, in the order the negotiator can try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpTransportKind {
    /// Modern streamable HTTP transport.
    Streamable,
    /// Legacy SSE transport.
    Sse,
}

impl std::fmt::Display for HttpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streamable => write!(f, "streamable-http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Candidate trial order for an upstream URL. Pure function of the URL:
/// a path ending in the legacy `/sse` segment (case-insensitive, trailing
/// slashes stripped) tries SSE first; everything else, including `/mcp`,
/// tries streamable first.
pub fn transport_order(url: &str) -> [HttpTransportKind; 2] {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    let normalized = if path == "/" {
        "/"
    } else {
        path.trim_end_matches('/')
    };

    if normalized.ends_with("/sse") {
        [HttpTransportKind::Sse, HttpTransportKind::Streamable]
    } else {
        [HttpTransportKind::Streamable, HttpTransportKind::Sse]
    }
}

/// Normalize an `Allow` header value: split on commas, trim, uppercase,
/// dedupe, rejoin with `", "`. Returns `None` when nothing usable remains.
pub fn normalize_allow_header(header: &str) -> Option<String> {
    let mut seen = Vec::new();
    for method in header.split(',') {
        let method = method.trim().to_ascii_uppercase();
        if !method.is_empty() && !seen.contains(&method) {
            seen.push(method);
        }
    }
    if seen.is_empty() {
        None
    } else {
        Some(seen.join(", "))
    }
}

/// Failure details from one connect attempt. Explicit per-attempt state:
/// nothing is shared between retries.
#[derive(Debug)]
struct AttemptFailure {
    status: Option<u16>,
    /// Normalized `Allow` header observed on a 405 response, if any.
    allow: Option<String>,
    error: ProxyError,
}

impl AttemptFailure {
    fn from_error(error: ProxyError) -> Self {
        Self {
            status: None,
            allow: None,
            error,
        }
    }

    fn is_method_not_allowed(&self) -> bool {
        self.status == Some(405)
    }

    /// Whether this failure signature permits trying the next candidate.
    fn permits_fallback(&self) -> bool {
        static STATUS_TEXT: OnceLock<Regex> = OnceLock::new();

        if matches!(self.status, Some(404) | Some(405)) {
            return true;
        }
        // Some stacks bury the status in the message instead.
        let pattern = STATUS_TEXT.get_or_init(|| Regex::new(r"HTTP\s+40[45]").unwrap());
        pattern.is_match(&self.error.to_string())
    }
}

/// One candidate session: JSON-RPC over a single HTTP transport kind.
struct HttpSession {
    kind: HttpTransportKind,
    /// The upstream URL as configured.
    base_url: String,
    /// Where JSON-RPC requests are POSTed for this transport kind.
    post_url: String,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpSession {
    fn new(kind: HttpTransportKind, url: &str, client: reqwest::Client) -> Self {
        let post_url = match kind {
            HttpTransportKind::Streamable => url.to_string(),
            HttpTransportKind::Sse => format!("{}/message", url.trim_end_matches('/')),
        };
        Self {
            kind,
            base_url: url.to_string(),
            post_url,
            client,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_request(&self, method: &str, params: Option<Value>) -> McpRequest {
        let mut request =
            McpRequest::new(method).with_id(json!(self.next_id.fetch_add(1, Ordering::SeqCst)));
        if let Some(params) = params {
            request = request.with_params(params);
        }
        request
    }

    /// POST one JSON-RPC message. `Ok(None)` means an empty success body
    /// (notification acknowledgement).
    async fn post_rpc(&self, request: &McpRequest) -> Result<Option<McpResponse>, AttemptFailure> {
        let mut builder = self
            .client
            .post(&self.post_url)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(request);

        if let Some(session_id) = self.session_id.read().await.as_deref() {
            builder = builder.header("Mcp-Session-Id", session_id);
        }

        let response = builder.send().await.map_err(|e| {
            let error = if e.is_connect() {
                ProxyError::refused(
                    format!("Failed to connect to upstream at {}", self.base_url),
                    e.to_string(),
                )
            } else if e.is_timeout() {
                ProxyError::refused("Upstream request timed out", e.to_string())
            } else {
                ProxyError::refused("Upstream request failed", e.to_string())
            };
            AttemptFailure {
                status: e.status().map(|s| s.as_u16()),
                allow: None,
                error,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let allow = if status.as_u16() == 405 {
                response
                    .headers()
                    .get(reqwest::header::ALLOW)
                    .and_then(|v| v.to_str().ok())
                    .and_then(normalize_allow_header)
            } else {
                None
            };
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptFailure {
                status: Some(status.as_u16()),
                allow,
                error: ProxyError::refused(
                    format!("Upstream responded with HTTP {}", status),
                    body,
                ),
            });
        }

        // Streamable servers assign the session on the initialize response.
        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.write().await;
            if slot.as_deref() != Some(session_id) {
                debug!(session_id, "captured upstream session id");
                *slot = Some(session_id.to_string());
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| {
            AttemptFailure::from_error(ProxyError::invalid_response(
                "Failed to read upstream response body",
                e.to_string(),
            ))
        })?;

        if body.is_empty() {
            return Ok(None);
        }

        let payload = if content_type.contains("text/event-stream") {
            first_sse_message(&body).ok_or_else(|| {
                AttemptFailure::from_error(ProxyError::invalid_response(
                    "Upstream event stream carried no message",
                    body.clone(),
                ))
            })?
        } else {
            body
        };

        let parsed: McpResponse = serde_json::from_str(&payload).map_err(|e| {
            AttemptFailure::from_error(ProxyError::invalid_response(
                "Failed to parse upstream response as JSON-RPC",
                format!("{}: {}", e, payload),
            ))
        })?;

        Ok(Some(parsed))
    }

    /// MCP initialize handshake: `initialize` request followed by the
    /// `notifications/initialized` notification.
    async fn initialize(&self) -> Result<(), AttemptFailure> {
        let request = self.next_request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
        );

        let response = self.post_rpc(&request).await?.ok_or_else(|| {
            AttemptFailure::from_error(ProxyError::invalid_response(
                "Upstream returned an empty initialize response",
                String::new(),
            ))
        })?;

        if let Some(error) = response.error {
            return Err(AttemptFailure::from_error(ProxyError::invalid_response(
                format!("Initialize failed: {}", error.message),
                format!("code {}", error.code),
            )));
        }

        // Completing the handshake is best effort; some servers do not
        // acknowledge the notification at all.
        let initialized = McpRequest::new("notifications/initialized");
        if let Err(failure) = self.post_rpc(&initialized).await {
            debug!(error = %failure.error, "initialized notification not acknowledged");
        }

        Ok(())
    }

    /// Post-connect request path; attempt bookkeeping is no longer needed.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let request = self.next_request(method, params);
        let response = self
            .post_rpc(&request)
            .await
            .map_err(|failure| failure.error)?
            .ok_or_else(|| {
                ProxyError::invalid_response(
                    format!("Upstream returned an empty response to {}", method),
                    String::new(),
                )
            })?;

        if let Some(error) = response.error {
            return Err(ProxyError::invalid_response(
                format!("{} failed: {}", method, error.message),
                format!("code {}", error.code),
            ));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Graceful streamable session termination. Best effort.
    async fn terminate(&self) {
        if self.kind != HttpTransportKind::Streamable {
            return;
        }
        let session_id = self.session_id.read().await.clone();
        if let Some(session_id) = session_id {
            let result = self
                .client
                .delete(&self.base_url)
                .header("Mcp-Session-Id", session_id)
                .send()
                .await;
            if let Err(e) = result {
                debug!(error = %e, "session termination request failed");
            }
        }
    }
}

/// Extract the first JSON-RPC payload from an SSE-framed response body.
/// Events are separated by blank lines; only `message` events (the default
/// type) carry payloads.
fn first_sse_message(body: &str) -> Option<String> {
    for raw_event in body.split("\n\n") {
        let mut event_type: Option<&str> = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in raw_event.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                event_type = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        let is_message = event_type.map(|e| e == "message").unwrap_or(true);
        if is_message && !data_lines.is_empty() {
            return Some(data_lines.join("\n"));
        }
    }
    None
}

/// Upstream client for HTTP targets. Owns transport negotiation and the
/// active session.
pub struct HttpUpstreamClient {
    url: String,
    client: reqwest::Client,
    session: RwLock<Option<HttpSession>>,
    connected: AtomicBool,
}

impl HttpUpstreamClient {
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self, ProxyError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ProxyError::invalid_response(
                    format!("Invalid header name: {}", name),
                    e.to_string(),
                )
            })?;
            let value = value.parse().map_err(|_| {
                ProxyError::invalid_response(
                    format!("Invalid value for header {}", name),
                    String::new(),
                )
            })?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| {
                ProxyError::invalid_response("Failed to build HTTP client", e.to_string())
            })?;

        Ok(Self {
            url: url.to_string(),
            client,
            session: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Probe the upstream for the methods it advertises, OPTIONS first then
    /// HEAD, stopping at the first usable `Allow` header. Custom headers ride
    /// along via the client's defaults.
    async fn probe_allowed_methods(&self) -> Option<String> {
        for method in [reqwest::Method::OPTIONS, reqwest::Method::HEAD] {
            let response = match self.client.request(method.clone(), &self.url).send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(%method, error = %e, "method probe failed");
                    continue;
                }
            };
            let allow = response
                .headers()
                .get(reqwest::header::ALLOW)
                .and_then(|v| v.to_str().ok())
                .and_then(normalize_allow_header);
            if allow.is_some() {
                return allow;
            }
        }
        None
    }

    /// Resolve a surfaced 405 into the final error, recovering the supported
    /// method set when possible.
    async fn surface_method_not_allowed(&self, failure: AttemptFailure) -> ProxyError {
        let allowed = match failure.allow {
            Some(allow) => Some(allow),
            None => self.probe_allowed_methods().await,
        };
        ProxyError::MethodNotAllowed { allowed }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn connect(&self) -> Result<(), ProxyError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ProxyError::AlreadyConnected);
        }

        let order = transport_order(&self.url);

        for (index, kind) in order.iter().enumerate() {
            debug!(transport = %kind, url = %self.url, "attempting upstream transport");

            // Fresh session per candidate; a failed one is simply dropped.
            let session = HttpSession::new(*kind, &self.url, self.client.clone());

            let failure = match session.initialize().await {
                Ok(()) => {
                    info!(transport = %kind, url = %self.url, "connected to upstream");
                    *self.session.write().await = Some(session);
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(failure) => failure,
            };

            if let Some(internal) = failure.error.internal_details() {
                debug!(transport = %kind, internal, "upstream connect attempt failed");
            }

            let fallback_remains = index + 1 < order.len();
            // A streamable failure falls back only on a method-not-allowed
            // signature; a failed SSE attempt always yields to a remaining
            // streamable candidate.
            let fall_back = match kind {
                HttpTransportKind::Streamable => fallback_remains && failure.permits_fallback(),
                HttpTransportKind::Sse => fallback_remains,
            };
            if fall_back {
                info!(
                    transport = %kind,
                    "transport not supported by upstream, trying next candidate"
                );
                continue;
            }

            if failure.is_method_not_allowed() {
                return Err(self.surface_method_not_allowed(failure).await);
            }

            return Err(failure.error);
        }

        Err(ProxyError::refused(
            "No usable transport for upstream",
            format!("exhausted candidates for {}", self.url),
        ))
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(ProxyError::NotConnected)?;

        let result = session.request("tools/list", None).await?;
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
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(ProxyError::NotConnected)?;

        session
            .request(
                "tools/call",
                Some(json!({"name": name, "arguments": args})),
            )
            .await
    }

    async fn disconnect(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.terminate().await;
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

    #[test]
    fn test_sse_suffix_tries_legacy_first() {
        assert_eq!(
            transport_order("https://host/sse"),
            [HttpTransportKind::Sse, HttpTransportKind::Streamable]
        );
        assert_eq!(
            transport_order("https://host/api/SSE/"),
            [HttpTransportKind::Sse, HttpTransportKind::Streamable]
        );
    }

    #[test]
    fn test_mcp_and_unrecognized_paths_try_streamable_first() {
        for url in [
            "https://host/mcp",
            "https://host/mcp/",
            "https://host/",
            "https://host/api/v1",
            "https://host/ssex",
        ] {
            assert_eq!(
                transport_order(url),
                [HttpTransportKind::Streamable, HttpTransportKind::Sse],
                "wrong order for {}",
                url
            );
        }
    }

    #[test]
    fn test_normalize_allow_header() {
        assert_eq!(
            normalize_allow_header("post, options"),
            Some("POST, OPTIONS".to_string())
        );
        assert_eq!(
            normalize_allow_header(" GET ,POST, get "),
            Some("GET, POST".to_string())
        );
        assert_eq!(normalize_allow_header(""), None);
        assert_eq!(normalize_allow_header(" , ,"), None);
    }

    #[test]
    fn test_sse_session_posts_to_message_endpoint() {
        let client = reqwest::Client::new();
        let session = HttpSession::new(HttpTransportKind::Sse, "http://host/sse/", client.clone());
        assert_eq!(session.post_url, "http://host/sse/message");

        let session = HttpSession::new(HttpTransportKind::Streamable, "http://host/mcp", client);
        assert_eq!(session.post_url, "http://host/mcp");
    }

    #[test]
    fn test_first_sse_message_extraction() {
        let body = ": keepalive\n\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let data = first_sse_message(body).unwrap();
        assert!(data.contains("\"jsonrpc\""));

        // Default event type is "message".
        let body = "data: line1\ndata: line2\n\n";
        assert_eq!(first_sse_message(body).unwrap(), "line1\nline2");

        // Non-message events are skipped.
        let body = "event: ping\ndata: {}\n\n";
        assert!(first_sse_message(body).is_none());
    }

    #[test]
    fn test_fallback_permitted_on_status_and_text_signatures() {
        let by_status = AttemptFailure {
            status: Some(405),
            allow: None,
            error: ProxyError::refused("Upstream responded with HTTP 405", ""),
        };
        assert!(by_status.permits_fallback());
        assert!(by_status.is_method_not_allowed());

        let by_text = AttemptFailure::from_error(ProxyError::refused(
            "transport error: HTTP 404 from gateway",
            "",
        ));
        assert!(by_text.permits_fallback());
        assert!(!by_text.is_method_not_allowed());

        let unrelated = AttemptFailure::from_error(ProxyError::refused("connection reset", ""));
        assert!(!unrelated.permits_fallback());
    }
}
