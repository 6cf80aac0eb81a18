//! Fail-open utilities for graceful degradation
//!
//! Use these for side-calls whose failure must never fail a fault event, such
//! as gathering extra context for analysis or publishing outcomes.
//!
//! DO NOT use fail-open for:
//! - Fix generation (the pipeline's own work)
//! - Pull request creation (its failure is the event's failure)

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open, giving up once `limit` elapses
///
/// Logs the error or timeout via `tracing::warn!` and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use std::time::Duration;
/// use mender_core::fail_open::fail_open_within;
/// use mender_core::Result;
///
/// async fn fetch_related_docs() -> Result<String> {
///     Ok("docs".to_string())
/// }
///
/// async fn example() {
///     let docs = fail_open_within("context_enrichment", Duration::from_secs(5), || {
///         fetch_related_docs()
///     })
///     .await;
///     // docs is None if the lookup failed or ran out of time
/// }
/// ```
pub async fn fail_open_within<F, Fut, T>(operation_name: &str, limit: Duration, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, f()).await {
        Ok(Ok(val)) => Some(val),
        Ok(Err(e)) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
        Err(_) => {
            warn!(
                "{} timed out after {:?} (fail-open)",
                operation_name, limit
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MenderError;

    #[tokio::test]
    async fn test_fail_open_within_success() {
        let result = fail_open_within("test_op", Duration::from_secs(1), || async {
            Ok::<_, MenderError>("ctx")
        })
        .await;
        assert_eq!(result, Some("ctx"));
    }

    #[tokio::test]
    async fn test_fail_open_within_swallows_error() {
        let result = fail_open_within("test_op", Duration::from_secs(1), || async {
            Err::<i32, _>(MenderError::Other("test error".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_within_times_out() {
        let result = fail_open_within("test_op", Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, MenderError>(1)
        })
        .await;
        assert_eq!(result, None);
    }
}
