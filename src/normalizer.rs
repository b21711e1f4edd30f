use std::collections::BTreeSet;

use crate::models::{AggregatedListing, IdentityKey, ListingFields, RawListing, ScrapeTarget};
use crate::utils::error::{AppError, Result};

// Placeholders the scraper or upstream feeds use for "not available"
const PLACEHOLDERS: [&str; 3] = ["n/a", "unknown", "none"];

/// Scrub placeholder and blank values into `None`
pub fn present(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() || PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p)) {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

/// Convert one scraped record into the canonical listing shape.
///
/// Marketplace, site and base URL come from the configured target rather than
/// the record itself, and the category set starts as the label the record was
/// observed under. Fails only when the item identifier is missing.
pub fn normalize(raw: RawListing, target: &ScrapeTarget) -> Result<AggregatedListing> {
    let item_id = present(raw.asin)
        .ok_or_else(|| AppError::Validation(format!("listing in '{}' has no item identifier", target.category)))?;

    Ok(AggregatedListing {
        key: IdentityKey::new(&target.marketplace_id, &target.site, item_id),
        categories: BTreeSet::from([target.category.clone()]),
        fields: ListingFields {
            title: present(raw.title),
            current_price: present(raw.current_price),
            original_price: present(raw.original_price),
            discount: present(raw.discount),
            deal_badge: present(raw.deal_badge),
            image_url: present(raw.image_url),
            product_url: present(raw.product_url),
            brand_id: present(raw.brand_id),
            category: Some(target.category.clone()),
            base_url: Some(target.base_url.clone()),
        },
    })
}
