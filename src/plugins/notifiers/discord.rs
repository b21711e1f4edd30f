use crate::config::DiscordConfig;
use crate::models::ChangeKind;
use crate::plugins::traits::{NotificationEvent, NotificationResult, NotifierPlugin};
use crate::utils::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

// Guild text, DM, announcement, and the three thread kinds
const TEXT_CHANNEL_TYPES: [u8; 6] = [0, 1, 5, 10, 11, 12];

const NEW_DEAL_COLOR: u32 = 0x2ecc71;
const UPDATED_DEAL_COLOR: u32 = 0xe67e22;

// Discord rejects embeds beyond these lengths, counted in characters
const EMBED_TITLE_LIMIT: usize = 256;
const EMBED_FIELD_VALUE_LIMIT: usize = 1024;

/// Cut `text` to at most `limit` characters, marking the cut with an ellipsis
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitInfo {
    retry_after: Option<f64>,
}

/// Posts deal embeds to one Discord channel through the bot REST API
pub struct DiscordNotifier {
    client: Client,
    config: DiscordConfig,
    ready: AtomicBool,
}

impl DiscordNotifier {
    pub fn new(config: DiscordConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("DiscordBot (deal-watcher, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;

        Ok(DiscordNotifier {
            client,
            config,
            ready: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.config.token)
    }

    fn get_embed_color(&self, kind: ChangeKind) -> u32 {
        match kind {
            ChangeKind::New => NEW_DEAL_COLOR,
            ChangeKind::Updated => UPDATED_DEAL_COLOR,
        }
    }

    fn create_embed(&self, event: &NotificationEvent) -> serde_json::Value {
        let listing = &event.listing;
        let fields = &listing.fields;

        let mut price_lines = vec![format!("**Price:** {}", fields.current_price.as_deref().unwrap_or("N/A"))];
        if let Some(original) = &fields.original_price {
            price_lines.push(format!("**Original:** {}", original));
        }
        if let Some(discount) = &fields.discount {
            price_lines.push(format!("**Discount:** {}", discount));
        }

        let categories: Vec<&str> = listing.categories.iter().map(String::as_str).collect();

        let mut embed_fields = vec![
            json!({
                "name": "Pricing",
                "value": truncate_chars(&price_lines.join("\n"), EMBED_FIELD_VALUE_LIMIT),
                "inline": false
            }),
            json!({
                "name": "Details",
                "value": truncate_chars(
                    &format!(
                        "**Badge:** {}\n**ASIN:** {}\n**Categories:** {}",
                        fields.deal_badge.as_deref().unwrap_or("N/A"),
                        listing.key.item_id,
                        categories.join(", ")
                    ),
                    EMBED_FIELD_VALUE_LIMIT
                ),
                "inline": false
            }),
        ];

        if !event.change.changed_fields.is_empty() {
            let lines: Vec<String> = event
                .change
                .changed_fields
                .iter()
                .map(|(field, change)| {
                    format!(
                        "• `{}` changed from `{}` to `{}`",
                        field,
                        change.old.as_deref().unwrap_or("N/A"),
                        change.new.as_deref().unwrap_or("N/A")
                    )
                })
                .collect();

            embed_fields.push(json!({
                "name": "Changes",
                "value": truncate_chars(&lines.join("\n"), EMBED_FIELD_VALUE_LIMIT),
                "inline": false
            }));
        }

        let mut embed = json!({
            "title": truncate_chars(listing.title(), EMBED_TITLE_LIMIT),
            "description": event.change.label(),
            "color": self.get_embed_color(event.change.kind),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "fields": embed_fields,
            "footer": { "text": "Amazon Deals Monitor" }
        });

        if let Some(url) = &fields.product_url {
            embed["url"] = json!(url);
        }

        if let Some(image) = &fields.image_url {
            embed["thumbnail"] = json!({ "url": image });
        }

        embed
    }
}

#[async_trait]
impl NotifierPlugin for DiscordNotifier {
    fn name(&self) -> &str {
        "Discord Notifier"
    }

    fn plugin_type(&self) -> &str {
        "discord"
    }

    async fn initialize(&self) -> Result<()> {
        let channel_id = self.config.channel_id;
        let response = self
            .client
            .get(self.url(&format!("/channels/{}", channel_id)))
            .header("Authorization", self.authorization())
            .send()
            .await
            .map_err(|e| AppError::ChannelResolution(format!("Could not reach Discord: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(AppError::ChannelResolution(format!(
                    "Channel ID {} was not found. Make sure the bot has been added to the server.",
                    channel_id
                )));
            }
            StatusCode::FORBIDDEN => {
                return Err(AppError::ChannelResolution(format!(
                    "Bot lacks access to channel ID {}. Grant the bot permission to view and send messages in that channel.",
                    channel_id
                )));
            }
            status if !status.is_success() => {
                return Err(AppError::ChannelResolution(format!(
                    "Resolving channel ID {} failed with status {}",
                    channel_id, status
                )));
            }
            _ => {}
        }

        let channel: ChannelInfo = response
            .json()
            .await
            .map_err(|e| AppError::ChannelResolution(format!("Unexpected channel payload: {}", e)))?;

        if !TEXT_CHANNEL_TYPES.contains(&channel.kind) {
            return Err(AppError::ChannelResolution(format!(
                "Channel ID {} is not a text-compatible channel",
                channel_id
            )));
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("Notifications will be sent to channel {}", channel_id);
        Ok(())
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationResult> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(AppError::Delivery("Deals channel not ready".to_string()));
        }

        let payload = json!({ "embeds": [self.create_embed(event)] });

        let response = self
            .client
            .post(self.url(&format!("/channels/{}/messages", self.config.channel_id)))
            .header("Authorization", self.authorization())
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Discord request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_hint = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let body_hint = response
                .json::<RateLimitInfo>()
                .await
                .ok()
                .and_then(|info| info.retry_after);

            return Err(AppError::RateLimited {
                retry_after: body_hint.or(header_hint),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Delivery(format!("Discord returned {}: {}", status, body)));
        }

        let message_id = response.json::<MessageInfo>().await.ok().map(|m| m.id);
        Ok(NotificationResult::delivered(message_id))
    }

    async fn shutdown(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregatedListing, ChangeEvent, FieldChange, IdentityKey, ListingFields, WatchedField};
    use std::collections::{BTreeMap, BTreeSet};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(api_base: &str) -> DiscordConfig {
        DiscordConfig {
            token: "secret".to_string(),
            channel_id: 42,
            api_base: api_base.to_string(),
        }
    }

    fn create_test_listing() -> AggregatedListing {
        AggregatedListing {
            key: IdentityKey::new("A1RKKUPIHCS9HS", "Amazon Spain", "B0TEST"),
            categories: BTreeSet::from(["Beauty".to_string(), "Gaming & Accessories".to_string()]),
            fields: ListingFields {
                title: Some("Hair Dryer".to_string()),
                current_price: Some("€19.99".to_string()),
                original_price: Some("€29.99".to_string()),
                discount: None,
                deal_badge: Some("Limited time deal".to_string()),
                image_url: Some("https://m.media-amazon.com/images/I/71abc.jpg".to_string()),
                product_url: Some("https://www.amazon.es/dp/B0TEST".to_string()),
                ..Default::default()
            },
        }
    }

    fn create_update_event() -> NotificationEvent {
        let mut changes = BTreeMap::new();
        changes.insert(
            WatchedField::CurrentPrice,
            FieldChange {
                old: Some("€24.99".to_string()),
                new: Some("€19.99".to_string()),
            },
        );
        changes.insert(
            WatchedField::DealBadge,
            FieldChange {
                old: None,
                new: Some("Limited time deal".to_string()),
            },
        );
        NotificationEvent::new(create_test_listing(), ChangeEvent::updated(changes).unwrap())
    }

    async fn ready_notifier(server: &MockServer) -> DiscordNotifier {
        Mock::given(method("GET"))
            .and(path("/channels/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "42", "type": 0 })))
            .mount(server)
            .await;

        let notifier = DiscordNotifier::new(create_test_config(&server.uri())).unwrap();
        notifier.initialize().await.unwrap();
        notifier
    }

    #[test]
    fn test_discord_notifier_metadata() {
        let notifier = DiscordNotifier::new(create_test_config("https://discord.com/api/v10")).unwrap();

        assert_eq!(notifier.name(), "Discord Notifier");
        assert_eq!(notifier.plugin_type(), "discord");
    }

    #[test]
    fn test_embed_color_selection() {
        let notifier = DiscordNotifier::new(create_test_config("https://discord.com/api/v10")).unwrap();

        assert_eq!(notifier.get_embed_color(ChangeKind::New), 0x2ecc71);
        assert_eq!(notifier.get_embed_color(ChangeKind::Updated), 0xe67e22);
    }

    #[test]
    fn test_embed_creation_for_update() {
        let notifier = DiscordNotifier::new(create_test_config("https://discord.com/api/v10")).unwrap();
        let embed = notifier.create_embed(&create_update_event());

        assert_eq!(embed["title"], "Hair Dryer");
        assert_eq!(embed["url"], "https://www.amazon.es/dp/B0TEST");
        assert_eq!(embed["description"], "Updated deal");
        assert_eq!(embed["color"].as_u64().unwrap(), 0xe67e22);
        assert_eq!(embed["footer"]["text"], "Amazon Deals Monitor");
        assert_eq!(embed["thumbnail"]["url"], "https://m.media-amazon.com/images/I/71abc.jpg");

        let fields = embed["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 3);

        let pricing = fields[0]["value"].as_str().unwrap();
        assert!(pricing.contains("**Price:** €19.99"));
        assert!(pricing.contains("**Original:** €29.99"));
        assert!(!pricing.contains("Discount"));

        let details = fields[1]["value"].as_str().unwrap();
        assert!(details.contains("**ASIN:** B0TEST"));
        assert!(details.contains("**Categories:** Beauty, Gaming & Accessories"));

        let changes = fields[2]["value"].as_str().unwrap();
        assert!(changes.contains("`current_price` changed from `€24.99` to `€19.99`"));
        assert!(changes.contains("`deal_badge` changed from `N/A` to `Limited time deal`"));
    }

    #[test]
    fn test_embed_creation_for_sparse_new_deal() {
        let notifier = DiscordNotifier::new(create_test_config("https://discord.com/api/v10")).unwrap();
        let listing = AggregatedListing {
            key: IdentityKey::new("A1RKKUPIHCS9HS", "Amazon Spain", "B0BARE"),
            categories: BTreeSet::from(["Books".to_string()]),
            fields: ListingFields::default(),
        };

        let embed = notifier.create_embed(&NotificationEvent::new(listing, ChangeEvent::new_deal()));

        assert_eq!(embed["title"], "Amazon Deal");
        assert_eq!(embed["description"], "New deal");
        assert_eq!(embed["color"].as_u64().unwrap(), 0x2ecc71);
        assert!(embed.get("url").is_none());
        assert!(embed.get("thumbnail").is_none());
        assert_eq!(embed["fields"].as_array().unwrap().len(), 2);
        assert!(embed["fields"][0]["value"].as_str().unwrap().contains("**Price:** N/A"));
    }

    #[test]
    fn test_embed_respects_discord_length_limits() {
        let notifier = DiscordNotifier::new(create_test_config("https://discord.com/api/v10")).unwrap();
        let mut listing = create_test_listing();
        listing.fields.title = Some("Ñ".repeat(400));
        listing.fields.deal_badge = Some("x".repeat(2000));

        let embed = notifier.create_embed(&NotificationEvent::new(listing, ChangeEvent::new_deal()));

        let title = embed["title"].as_str().unwrap();
        assert_eq!(title.chars().count(), 256);
        assert!(title.ends_with('…'));
        let details = embed["fields"][1]["value"].as_str().unwrap();
        assert_eq!(details.chars().count(), 1024);
    }

    #[test]
    fn test_truncate_chars_keeps_short_text() {
        assert_eq!(truncate_chars("Hair Dryer", 256), "Hair Dryer");
        assert_eq!(truncate_chars("abcdef", 4), "abc…");
    }

    #[tokio::test]
    async fn test_initialize_resolves_text_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/42"))
            .and(header("Authorization", "Bot secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "42", "type": 0 })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = DiscordNotifier::new(create_test_config(&server.uri())).unwrap();
        assert!(notifier.initialize().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_channel_errors_are_fatal() {
        for (status, body, expected) in [
            (404, json!({}), "was not found"),
            (403, json!({}), "lacks access"),
            (200, json!({ "id": "42", "type": 2 }), "not a text-compatible"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/channels/42"))
                .respond_with(ResponseTemplate::new(status).set_body_json(body))
                .mount(&server)
                .await;

            let notifier = DiscordNotifier::new(create_test_config(&server.uri())).unwrap();
            let err = notifier.initialize().await.unwrap_err();

            assert!(err.is_fatal());
            assert!(err.to_string().contains(expected), "{}", err);
        }
    }

    #[tokio::test]
    async fn test_notify_posts_embed() {
        let server = MockServer::start().await;
        let notifier = ready_notifier(&server).await;

        Mock::given(method("POST"))
            .and(path("/channels/42/messages"))
            .and(header("Authorization", "Bot secret"))
            .and(body_partial_json(json!({ "embeds": [{ "description": "Updated deal" }] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "999" })))
            .expect(1)
            .mount(&server)
            .await;

        let result = notifier.notify(&create_update_event()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("999"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_notify_rate_limited() {
        let server = MockServer::start().await;
        let notifier = ready_notifier(&server).await;

        Mock::given(method("POST"))
            .and(path("/channels/42/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({ "retry_after": 1.5, "global": false })))
            .mount(&server)
            .await;

        let err = notifier.notify(&create_update_event()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(matches!(err, AppError::RateLimited { retry_after: Some(r) } if (r - 1.5).abs() < f64::EPSILON));
    }

    #[tokio::test]
    async fn test_notify_other_failure_is_delivery_error() {
        let server = MockServer::start().await;
        let notifier = ready_notifier(&server).await;

        Mock::given(method("POST"))
            .and(path("/channels/42/messages"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = notifier.notify(&create_update_event()).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
        assert!(!err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_notify_before_initialize_fails() {
        let notifier = DiscordNotifier::new(create_test_config("http://127.0.0.1:9")).unwrap();
        let err = notifier.notify(&create_update_event()).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let server = MockServer::start().await;
        let notifier = ready_notifier(&server).await;

        assert!(notifier.shutdown().await.is_ok());
        assert!(notifier.notify(&create_update_event()).await.is_err());
    }
}
