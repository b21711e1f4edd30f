use std::time::Duration;

use thiserror::Error;

use crate::models::IdentityKey;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel resolution failed: {0}")]
    ChannelResolution(String),

    #[error("Scraping error: {0}")]
    Scraping(String),

    #[error("Reconciliation failed for {key}: {message}")]
    Reconciliation { key: IdentityKey, message: String },

    #[error("Rate limited by notification channel")]
    RateLimited { retry_after: Option<f64> },

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },
}

impl AppError {
    /// Transient delivery failure that is worth one more attempt
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited { .. })
    }

    /// Errors that must stop the process from starting its scheduled work.
    /// Everything else is recovered per unit of work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::InvalidConfig(_) | AppError::ChannelResolution(_)
        )
    }
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
