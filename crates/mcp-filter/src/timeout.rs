//! Deadline guard for upstream operations.
//!
//! Every upstream call that could hang (connect, tool listing) runs under
//! this guard. `tokio::time::timeout` drops its timer on both outcomes, so
//! nothing leaks on the success path.

use crate::error::ProxyError;
use std::future::Future;
use std::time::Duration;

/// Race `operation` against `limit`. On elapse, fail with a timeout error
/// carrying `label` and the bound that was exceeded.
pub async fn with_timeout<T, F>(
    operation: F,
    limit: Duration,
    label: &str,
) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout {
            label: label.to_string(),
            limit_ms: limit.as_millis() as u64,
        }),
    }
}
