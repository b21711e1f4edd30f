use crate::plugins::traits::{NotificationEvent, NotificationResult, NotifierPlugin};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Writes each change to the log instead of delivering it
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }

    fn describe(event: &NotificationEvent) -> String {
        let listing = &event.listing;
        let mut line = format!(
            "{}: {} [{}] price={}",
            event.change.label(),
            listing.title(),
            listing.key,
            listing.fields.current_price.as_deref().unwrap_or("N/A")
        );

        for (field, change) in &event.change.changed_fields {
            line.push_str(&format!(
                " {}: {} -> {}",
                field,
                change.old.as_deref().unwrap_or("N/A"),
                change.new.as_deref().unwrap_or("N/A")
            ));
        }

        line
    }
}

#[async_trait]
impl NotifierPlugin for LogNotifier {
    fn name(&self) -> &str {
        "Log Notifier"
    }

    fn plugin_type(&self) -> &str {
        "log"
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!("Dry run: notifications will only be logged");
        Ok(())
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationResult> {
        tracing::info!("{}", Self::describe(event));
        Ok(NotificationResult::delivered(None))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
