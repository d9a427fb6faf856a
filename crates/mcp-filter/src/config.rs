//! Proxy configuration.
//!
//! Built once by the CLI boundary and immutable for the process lifetime.
//! The CLI is responsible for mutual exclusion between deny/allow modes and
//! between HTTP-only and stdio-only options; the core only ever sees one
//! upstream variant and one pattern list.

use crate::filter::FilterMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_tool_list_timeout() -> u64 {
    10_000
}

/// Deadlines for upstream operations, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,
    #[serde(default = "default_tool_list_timeout")]
    pub tool_list_ms: u64,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            tool_list_ms: default_tool_list_timeout(),
        }
    }
}

impl ProxyTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn tool_list(&self) -> Duration {
        Duration::from_millis(self.tool_list_ms)
    }
}

/// Where the upstream MCP server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum UpstreamTarget {
    /// Remote server reached over HTTP (streamable or legacy SSE transport).
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Local server spawned as a subprocess, spoken to over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

/// Full proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub upstream: UpstreamTarget,
    /// Patterns interpreted under `mode`; deny and allow lists are mutually
    /// exclusive upstream of this struct.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub timeouts: ProxyTimeouts,
}

impl ProxyConfig {
    /// Configuration for an HTTP upstream.
    pub fn http(url: &str) -> Self {
        Self {
            upstream: UpstreamTarget::Http {
                url: url.to_string(),
                headers: HashMap::new(),
            },
            patterns: vec![],
            mode: FilterMode::Deny,
            timeouts: ProxyTimeouts::default(),
        }
    }

    /// Configuration for a subprocess upstream.
    pub fn stdio(command: &str, args: Vec<String>) -> Self {
        Self {
            upstream: UpstreamTarget::Stdio {
                command: command.to_string(),
                args,
                env: HashMap::new(),
            },
            patterns: vec![],
            mode: FilterMode::Deny,
            timeouts: ProxyTimeouts::default(),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<String>, mode: FilterMode) -> Self {
        self.patterns = patterns;
        self.mode = mode;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        if let UpstreamTarget::Http { headers: h, .. } = &mut self.upstream {
            *h = headers;
        }
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        if let UpstreamTarget::Stdio { env: e, .. } = &mut self.upstream {
            *e = env;
        }
        self
    }

    pub fn with_timeouts(mut self, timeouts: ProxyTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Human-readable upstream identifier for log messages.
    pub fn identifier(&self) -> String {
        match &self.upstream {
            UpstreamTarget::Http { url, .. } => url.clone(),
            UpstreamTarget::Stdio { command, args, .. } => {
                let mut parts = vec![command.clone()];
                parts.extend(args.iter().cloned());
                parts.join(" ")
            }
        }
    }
}
