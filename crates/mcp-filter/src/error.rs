//! Error taxonomy for the proxy core.
//!
//! Errors are classified where the failure is first observed, so downstream
//! logic matches on a variant instead of re-parsing error strings. Variants
//! that wrap low-level failures carry a sanitized user-facing message plus a
//! separate internal-detail string that is logged but never rendered to the
//! end user.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// All failures the proxy core can produce.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// An upstream operation did not complete within its deadline.
    #[error("{label} after {limit_ms}ms")]
    Timeout { label: String, limit_ms: u64 },

    /// The upstream endpoint refused or dropped the connection.
    #[error("{message}")]
    Refused { message: String, internal: String },

    /// The upstream responded with something that is not a usable MCP reply.
    #[error("{message}")]
    InvalidResponse { message: String, internal: String },

    /// The upstream rejected the HTTP method used by the attempted transport.
    #[error("{}", method_not_allowed_text(.allowed.as_deref()))]
    MethodNotAllowed { allowed: Option<String> },

    /// A filter pattern failed to compile.
    #[error("Invalid regex pattern in filter list: {pattern}\nPattern must be a valid regular expression")]
    InvalidPattern { pattern: String },

    /// A filter pattern compiled but risks catastrophic backtracking.
    #[error("Unsafe regex pattern detected: {pattern}\nPattern could cause catastrophic backtracking")]
    UnsafePattern { pattern: String },

    /// A tool call named something outside the allowed cache.
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// Cached-data query before startup completed (or after shutdown).
    #[error("Proxy not ready")]
    NotReady,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

impl ProxyError {
    pub fn refused(message: impl Into<String>, internal: impl Into<String>) -> Self {
        Self::Refused {
            message: sanitize_message(&message.into()),
            internal: internal.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>, internal: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: sanitize_message(&message.into()),
            internal: internal.into(),
        }
    }

    /// The internal-detail channel, if this variant carries one.
    pub fn internal_details(&self) -> Option<&str> {
        match self {
            Self::Refused { internal, .. } | Self::InvalidResponse { internal, .. } => {
                Some(internal)
            }
            _ => None,
        }
    }
}

fn method_not_allowed_text(allowed: Option<&str>) -> String {
    match allowed {
        Some(methods) => format!(
            "Upstream responded with HTTP 405 Method Not Allowed. Supported methods: {}.",
            methods
        ),
        None => "Upstream responded with HTTP 405 Method Not Allowed and did not provide an Allow header."
            .to_string(),
    }
}

/// Strip filesystem paths and stack-frame fragments from a message before it
/// enters the user-facing channel.
pub fn sanitize_message(message: &str) -> String {
    static FILE_PATH: OnceLock<Regex> = OnceLock::new();
    static STACK_FRAME: OnceLock<Regex> = OnceLock::new();

    let file_path = FILE_PATH
        .get_or_init(|| Regex::new(r"[/\\][\w/\\.\-]+\.(rs|ts|js|json|toml)(:\d+(:\d+)?)?").unwrap());
    let stack_frame = STACK_FRAME.get_or_init(|| Regex::new(r"\n\s+at\s+.*").unwrap());

    let sanitized = file_path.replace_all(message, "[file]");
    let sanitized = stack_frame.replace_all(&sanitized, "");
    sanitized.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_file_paths() {
        let msg = "failed to open /home/user/secrets/config.json: permission denied";
        let sanitized = sanitize_message(msg);
        assert!(!sanitized.contains("/home/user"));
        assert!(sanitized.contains("[file]"));
    }

    #[test]
    fn test_sanitize_strips_stack_frames() {
        let msg = "boom\n    at handler (/srv/app/main.js:10:5)\n    at run";
        let sanitized = sanitize_message(msg);
        assert_eq!(sanitized, "boom");
    }

    #[test]
    fn test_sanitize_leaves_plain_messages_alone() {
        let msg = "connection refused by upstream";
        assert_eq!(sanitize_message(msg), msg);
    }

    #[test]
    fn test_method_not_allowed_with_methods() {
        let err = ProxyError::MethodNotAllowed {
            allowed: Some("POST, OPTIONS".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Upstream responded with HTTP 405 Method Not Allowed. Supported methods: POST, OPTIONS."
        );
    }

    #[test]
    fn test_method_not_allowed_without_methods() {
        let err = ProxyError::MethodNotAllowed { allowed: None };
        assert!(err.to_string().contains("did not provide an Allow header"));
    }

    #[test]
    fn test_refused_keeps_internal_details_out_of_display() {
        let err = ProxyError::refused(
            "connection refused",
            "tcp connect error: /src/net/tcp.rs:42",
        );
        assert_eq!(err.to_string(), "connection refused");
        assert!(err.internal_details().unwrap().contains("tcp connect"));
    }

    #[test]
    fn test_timeout_display_carries_label_and_bound() {
        let err = ProxyError::Timeout {
            label: "Connection timeout".to_string(),
            limit_ms: 30000,
        };
        assert_eq!(err.to_string(), "Connection timeout after 30000ms");
    }
}
