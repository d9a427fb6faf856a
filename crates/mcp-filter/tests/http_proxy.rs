//! End-to-end tests against mock HTTP upstreams.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, options, post};
use axum::{Json, Router};
use mcp_filter::{FilterMode, ProxyConfig, ProxyError, ToolFilterProxy};
use serde_json::{json, Value};

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn mock_tools() -> Value {
    json!([
        {"name": "read_file", "description": "Read a file", "inputSchema": {"type": "object"}},
        {"name": "write_file", "description": "Write a file", "inputSchema": {"type": "object"}},
        {"name": "list_dir", "description": "List a directory", "inputSchema": {"type": "object"}},
        {"name": "get_env", "description": "Read an env var", "inputSchema": {"type": "object"}},
    ])
}

/// Minimal upstream MCP server speaking plain JSON responses.
async fn rpc_handler(_headers: HeaderMap, Json(request): Json<Value>) -> Response {
    let id = request["id"].clone();
    match request["method"].as_str().unwrap_or("") {
        "initialize" => (
            [("mcp-session-id", "session-123")],
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock-upstream", "version": "0.0.0"}
                }
            })),
        )
            .into_response(),
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": mock_tools()}
        }))
        .into_response(),
        "tools/call" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{"type": "text", "text": request["params"]["name"]}]
            }
        }))
        .into_response(),
        method => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {}", method)}
        }))
        .into_response(),
    }
}

#[tokio::test]
async fn test_streamable_upstream_end_to_end() {
    // Requires the session id assigned at initialize to ride along on
    // every later request.
    async fn session_checked_rpc(headers: HeaderMap, json: Json<Value>) -> Response {
        let method = json.0["method"].as_str().unwrap_or("").to_string();
        if method != "initialize" && headers.get("mcp-session-id").is_none() {
            return (StatusCode::BAD_REQUEST, "missing session id").into_response();
        }
        rpc_handler(headers, json).await
    }

    let url = spawn_upstream(Router::new().route("/mcp", post(session_checked_rpc))).await;

    let config = ProxyConfig::http(&format!("{}/mcp", url))
        .with_patterns(vec![".*_file$".to_string()], FilterMode::Deny);
    let proxy = ToolFilterProxy::new(config).unwrap();

    proxy.start().await.unwrap();
    assert!(proxy.is_ready().await);

    let names: Vec<String> = proxy
        .tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["list_dir", "get_env"]);

    let result = proxy.call_tool("list_dir", json!({})).await.unwrap();
    assert_eq!(result["content"][0]["text"], "list_dir");

    let denied = proxy.call_tool("read_file", json!({})).await.unwrap_err();
    assert!(matches!(denied, ProxyError::ToolNotFound { .. }));

    proxy.shutdown().await;
    assert!(!proxy.is_ready().await);
}

#[tokio::test]
async fn test_falls_back_to_sse_when_streamable_is_rejected() {
    async fn reject_streamable() -> Response {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [("allow", "GET")],
            "Method Not Allowed",
        )
            .into_response()
    }

    // Legacy endpoint answering with SSE-framed bodies.
    async fn sse_rpc_handler(headers: HeaderMap, json: Json<Value>) -> Response {
        let inner = rpc_handler(headers, json).await;
        if inner.status() != StatusCode::OK {
            return inner;
        }
        let body = axum::body::to_bytes(inner.into_body(), usize::MAX)
            .await
            .unwrap();
        let framed = format!(
            "event: message\ndata: {}\n\n",
            String::from_utf8(body.to_vec()).unwrap()
        );
        ([("content-type", "text/event-stream")], framed).into_response()
    }

    let url = spawn_upstream(
        Router::new()
            .route("/mcp", post(reject_streamable))
            .route("/mcp/message", post(sse_rpc_handler)),
    )
    .await;

    let config = ProxyConfig::http(&format!("{}/mcp", url));
    let proxy = ToolFilterProxy::new(config).unwrap();

    proxy.start().await.unwrap();
    assert_eq!(proxy.tools().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_sse_first_url_falls_back_to_streamable() {
    async fn reject_legacy() -> Response {
        (StatusCode::METHOD_NOT_ALLOWED, [("allow", "POST")], "Method Not Allowed")
            .into_response()
    }

    // Legacy endpoint is dead, but the same URL serves the streamable
    // transport; the failed SSE attempt must yield to it.
    let url = spawn_upstream(
        Router::new()
            .route("/sse/message", post(reject_legacy))
            .route("/sse", post(rpc_handler)),
    )
    .await;

    let config = ProxyConfig::http(&format!("{}/sse", url));
    let proxy = ToolFilterProxy::new(config).unwrap();

    proxy.start().await.unwrap();
    assert_eq!(proxy.tools().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_405_surfaces_allow_header_from_the_final_failed_attempt() {
    async fn reject_streamable() -> Response {
        // This Allow value belongs to the earlier attempt and must not leak
        // into the surfaced error.
        (StatusCode::METHOD_NOT_ALLOWED, [("allow", "GET")], "Method Not Allowed")
            .into_response()
    }

    async fn reject_legacy_with_allow() -> Response {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [("allow", "post, options")],
            "Method Not Allowed",
        )
            .into_response()
    }

    let url = spawn_upstream(
        Router::new()
            .route("/mcp", post(reject_streamable))
            .route("/mcp/message", post(reject_legacy_with_allow)),
    )
    .await;

    let config = ProxyConfig::http(&format!("{}/mcp", url));
    let proxy = ToolFilterProxy::new(config).unwrap();

    let err = proxy.start().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Upstream responded with HTTP 405 Method Not Allowed. Supported methods: POST, OPTIONS."
    );
}

#[tokio::test]
async fn test_405_without_allow_header_recovers_via_options_probe() {
    async fn reject_bare() -> Response {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
    }

    async fn options_probe() -> Response {
        (StatusCode::NO_CONTENT, [("allow", "POST, OPTIONS")], "").into_response()
    }

    let url = spawn_upstream(
        Router::new()
            .route("/mcp", post(reject_bare).options(options_probe))
            .route("/mcp/message", post(reject_bare)),
    )
    .await;

    let config = ProxyConfig::http(&format!("{}/mcp", url));
    let proxy = ToolFilterProxy::new(config).unwrap();

    let err = proxy.start().await.unwrap_err();
    assert!(err.to_string().contains("Supported methods: POST, OPTIONS."));
}

#[tokio::test]
async fn test_405_with_no_recoverable_allow_reports_its_absence() {
    async fn reject_bare() -> Response {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
    }

    // `any` keeps the OPTIONS/HEAD probe from seeing an Allow header too.
    let url = spawn_upstream(
        Router::new()
            .route("/mcp", any(reject_bare))
            .route("/mcp/message", any(reject_bare)),
    )
    .await;

    let config = ProxyConfig::http(&format!("{}/mcp", url));
    let proxy = ToolFilterProxy::new(config).unwrap();

    let err = proxy.start().await.unwrap_err();
    assert!(err.to_string().contains("did not provide an Allow header"));
}

#[tokio::test]
async fn test_custom_headers_reach_the_upstream() {
    async fn authed_rpc(headers: HeaderMap, json: Json<Value>) -> Response {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer secret") => rpc_handler(headers, json).await,
            _ => (StatusCode::UNAUTHORIZED, "missing credentials").into_response(),
        }
    }

    let url = spawn_upstream(Router::new().route("/mcp", post(authed_rpc))).await;

    let mut headers = std::collections::HashMap::new();
    headers.insert("Authorization".to_string(), "Bearer secret".to_string());
    let config = ProxyConfig::http(&format!("{}/mcp", url)).with_headers(headers);
    let proxy = ToolFilterProxy::new(config).unwrap();

    proxy.start().await.unwrap();
    assert_eq!(proxy.tools().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_unreachable_upstream_is_refused() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ProxyConfig::http(&format!("http://{}/mcp", addr));
    let proxy = ToolFilterProxy::new(config).unwrap();

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::Refused { .. }));
    assert!(!proxy.is_ready().await);
}

#[tokio::test]
async fn test_allow_mode_exposes_only_listed_tools() {
    let url = spawn_upstream(Router::new().route("/mcp", post(rpc_handler))).await;

    let config = ProxyConfig::http(&format!("{}/mcp", url))
        .with_patterns(vec!["^read_file$".to_string()], FilterMode::Allow);
    let proxy = ToolFilterProxy::new(config).unwrap();

    proxy.start().await.unwrap();
    let names: Vec<String> = proxy
        .tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["read_file"]);
    assert!(!proxy.is_allowed("list_dir").await.unwrap());
}
