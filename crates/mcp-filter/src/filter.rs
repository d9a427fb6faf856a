//! Tool filtering engine.
//!
//! Applies allow/deny regex patterns to an upstream tool list, with pattern
//! validation up front: every pattern must compile and must be structurally
//! safe against catastrophic backtracking before any matching runs.

use crate::error::ProxyError;
use crate::protocol::Tool;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Filtering direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Matching tools are removed; everything else passes (fail-open default).
    #[default]
    Deny,
    /// Matching tools pass; everything else is removed (fail-closed default).
    Allow,
}

/// Outcome of validating a single pattern.
#[derive(Debug, Clone)]
pub struct PatternCheck {
    pub compiles: bool,
    pub safe: bool,
    pub diagnostic: Option<String>,
}

impl PatternCheck {
    pub fn ok() -> Self {
        Self {
            compiles: true,
            safe: true,
            diagnostic: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.compiles && self.safe
    }
}

/// Result of applying a pattern set to a tool list.
///
/// Both partitions preserve the upstream ordering. `unmatched_patterns`
/// lists the input patterns that matched zero tools; it is a usability
/// diagnostic (typically a typo in a tool name), never a fatal error.
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub allowed: Vec<Tool>,
    pub denied: Vec<String>,
    pub unmatched_patterns: Vec<String>,
}

/// Validate that a pattern compiles and is safe to execute.
pub fn validate_pattern(pattern: &str) -> PatternCheck {
    if Regex::new(pattern).is_err() {
        return PatternCheck {
            compiles: false,
            safe: false,
            diagnostic: Some(format!(
                "Invalid regex pattern in filter list: {}\nPattern must be a valid regular expression",
                pattern
            )),
        };
    }

    if has_nested_unbounded_repetition(pattern) {
        return PatternCheck {
            compiles: true,
            safe: false,
            diagnostic: Some(format!(
                "Unsafe regex pattern detected: {}\nPattern could cause catastrophic backtracking",
                pattern
            )),
        };
    }

    PatternCheck::ok()
}

/// Validate a batch of patterns left to right, stopping at the first failure
/// so error messages are deterministic.
pub fn validate_patterns(patterns: &[String]) -> Result<(), ProxyError> {
    for pattern in patterns {
        let check = validate_pattern(pattern);
        if !check.compiles {
            return Err(ProxyError::InvalidPattern {
                pattern: pattern.clone(),
            });
        }
        if !check.safe {
            return Err(ProxyError::UnsafePattern {
                pattern: pattern.clone(),
            });
        }
    }
    Ok(())
}

/// Structural scan for an unbounded repetition applied to a group that itself
/// contains an unbounded repetition (e.g. `(a+)+`). Such patterns can blow up
/// exponentially under a backtracking matcher, so they are rejected before
/// they ever reach match execution.
fn has_nested_unbounded_repetition(pattern: &str) -> bool {
    struct GroupFrame {
        contains_unbounded: bool,
    }

    let chars: Vec<char> = pattern.chars().collect();
    let mut stack: Vec<GroupFrame> = Vec::new();
    // Set when the most recent atom was a group containing an unbounded
    // repetition; a following unbounded quantifier makes the pattern unsafe.
    let mut last_group_unbounded = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                // Escaped literal, consumes the next char.
                i += 1;
                last_group_unbounded = false;
            }
            '[' => {
                // Character class: skip to the closing bracket.
                i += 1;
                if i < chars.len() && chars[i] == '^' {
                    i += 1;
                }
                if i < chars.len() && chars[i] == ']' {
                    i += 1;
                }
                while i < chars.len() && chars[i] != ']' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                last_group_unbounded = false;
            }
            '(' => {
                stack.push(GroupFrame {
                    contains_unbounded: false,
                });
                last_group_unbounded = false;
            }
            ')' => {
                let closed_unbounded = stack.pop().map(|f| f.contains_unbounded).unwrap_or(false);
                if closed_unbounded {
                    // The enclosing group transitively contains the repetition.
                    if let Some(parent) = stack.last_mut() {
                        parent.contains_unbounded = true;
                    }
                }
                last_group_unbounded = closed_unbounded;
            }
            c => {
                let unbounded = match c {
                    '*' | '+' => true,
                    '{' => {
                        // `{n,}` is unbounded; `{n}` and `{n,m}` are not.
                        let mut j = i + 1;
                        let mut saw_comma_last = false;
                        while j < chars.len() && chars[j] != '}' {
                            saw_comma_last = chars[j] == ',';
                            j += 1;
                        }
                        let unbounded = j < chars.len() && saw_comma_last;
                        i = j;
                        unbounded
                    }
                    _ => {
                        last_group_unbounded = false;
                        i += 1;
                        continue;
                    }
                };

                if unbounded {
                    if last_group_unbounded {
                        return true;
                    }
                    if let Some(frame) = stack.last_mut() {
                        frame.contains_unbounded = true;
                    }
                }
                last_group_unbounded = false;
            }
        }
        i += 1;
    }

    false
}

/// Partition `tools` by the pattern set under the given mode.
///
/// Empty pattern lists take a fast path that never invokes the validator:
/// deny mode allows everything, allow mode denies everything. Otherwise all
/// patterns are validated first and any failure aborts the whole operation;
/// no partial filtering is ever applied.
pub fn apply_filters(
    tools: &[Tool],
    patterns: &[String],
    mode: FilterMode,
) -> Result<FilterResult, ProxyError> {
    if patterns.is_empty() {
        return Ok(match mode {
            FilterMode::Deny => FilterResult {
                allowed: tools.to_vec(),
                denied: vec![],
                unmatched_patterns: vec![],
            },
            FilterMode::Allow => FilterResult {
                allowed: vec![],
                denied: tools.iter().map(|t| t.name.clone()).collect(),
                unmatched_patterns: vec![],
            },
        });
    }

    validate_patterns(patterns)?;

    let compiled: Vec<Regex> = patterns
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<_, _>>()
        .map_err(|_| ProxyError::InvalidPattern {
            pattern: patterns.join(","),
        })?;

    let mut allowed = Vec::new();
    let mut denied = Vec::new();
    let mut pattern_matched = vec![false; compiled.len()];

    for tool in tools {
        let mut matched = false;
        for (idx, regex) in compiled.iter().enumerate() {
            if regex.is_match(&tool.name) {
                pattern_matched[idx] = true;
                matched = true;
            }
        }

        let keep = match mode {
            FilterMode::Deny => !matched,
            FilterMode::Allow => matched,
        };

        if keep {
            allowed.push(tool.clone());
        } else {
            denied.push(tool.name.clone());
        }
    }

    let unmatched_patterns = patterns
        .iter()
        .zip(&pattern_matched)
        .filter(|(_, matched)| !**matched)
        .map(|(pattern, _)| pattern.clone())
        .collect();

    Ok(FilterResult {
        allowed,
        denied,
        unmatched_patterns,
    })
}
