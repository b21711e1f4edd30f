pub mod error;

use std::future::Future;
use std::time::Duration;

use error::{AppError, Result};

/// Run an external call under a deadline, turning an elapsed deadline into
/// a recoverable `AppError::Timeout` for that unit of work.
pub async fn with_timeout<T, F>(operation: impl Into<String>, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            operation: operation.into(),
            timeout: limit,
        }),
    }
}
