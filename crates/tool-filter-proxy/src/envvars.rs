//! `--env` argument parsing for stdio upstreams.

use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::warn;

/// Parse repeated `KEY=value` environment arguments. Splits on the first
/// `=` so values may contain their own. Empty keys are skipped with a
/// warning; a missing `=` is an error.
pub fn parse_env_vars(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();

    for entry in raw {
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value),
            None => bail!("invalid env var '{}': expected 'KEY=value'", entry),
        };

        if key.is_empty() {
            warn!(entry = %entry, "skipping env var with empty key");
            continue;
        }

        env.insert(key.to_string(), value.to_string());
    }

    Ok(env)
}
