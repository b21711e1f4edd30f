use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AggregatedListing, ChangeEvent};
use crate::utils::error::Result;

/// One change to announce, with the merged listing it concerns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub listing: AggregatedListing,
    pub change: ChangeEvent,
}

impl NotificationEvent {
    pub fn new(listing: AggregatedListing, change: ChangeEvent) -> Self {
        Self { listing, change }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl NotificationResult {
    pub fn delivered(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }
}

/// Trait for implementing notification methods (Discord, log, etc.)
///
/// `notify` fails with `AppError::RateLimited` when the destination asks the
/// caller to back off, and with `AppError::Delivery` for anything else.
#[async_trait]
pub trait NotifierPlugin: Send + Sync {
    /// Plugin metadata
    fn name(&self) -> &str;
    fn plugin_type(&self) -> &str;

    /// Resolve the destination. Failure here is fatal at startup.
    async fn initialize(&self) -> Result<()>;
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationResult>;

    /// Plugin lifecycle
    async fn shutdown(&self) -> Result<()>;
}
