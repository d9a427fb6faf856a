//! `--header` argument parsing with environment expansion.

use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::warn;

/// Parse repeated `Name: Value` header arguments.
///
/// Values may reference process environment variables as `${VAR}` or `$VAR`;
/// missing variables expand to the empty string with a warning. Duplicate
/// names keep the last value.
pub fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();

    for entry in raw {
        let (name, value) = match entry.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => bail!("invalid header '{}': expected 'Name: Value'", entry),
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            bail!("invalid header name '{}': only letters, digits, '-' and '_' are allowed", name);
        }

        let expanded = expand_env(value);
        if headers.insert(name.to_string(), expanded).is_some() {
            warn!(header = %name, "duplicate header, keeping the last value");
        }
    }

    Ok(headers)
}

/// Expand `${VAR}` and `$VAR` references from the process environment.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    // Unterminated ${...} is kept literally.
                    out.push_str("${");
                    out.push_str(&name);
                    continue;
                }
                out.push_str(&lookup(&name));
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name));
            }
            _ => out.push('$'),
        }
    }

    out
}

fn lookup(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) => value,
        Err(_) => {
            warn!(variable = %name, "environment variable not set, expanding to empty");
            String::new()
        }
    }
}
