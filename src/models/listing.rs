use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::WatchedField;

/// Names one tracked item across categories and cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub marketplace_id: String,
    pub site: String,
    pub item_id: String,
}

impl IdentityKey {
    pub fn new(marketplace_id: impl Into<String>, site: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            marketplace_id: marketplace_id.into(),
            site: site.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.marketplace_id, self.site, self.item_id)
    }
}

/// One (site, category) unit of scraping work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub site: String,
    pub base_url: String,
    pub marketplace_id: String,
    pub category: String,
}

/// A listing as produced by the scraper. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub asin: Option<String>,
    pub title: Option<String>,
    pub current_price: Option<String>,
    pub original_price: Option<String>,
    pub discount: Option<String>,
    pub deal_badge: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub brand_id: Option<String>,
    pub category: Option<String>,
    pub marketplace_id: Option<String>,
    pub site: Option<String>,
    pub base_url: Option<String>,
}

/// Mutable listing attributes shared by aggregated listings and stored records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFields {
    pub title: Option<String>,
    pub current_price: Option<String>,
    pub original_price: Option<String>,
    pub discount: Option<String>,
    pub deal_badge: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub brand_id: Option<String>,
    /// Category label of the most recent observation
    pub category: Option<String>,
    pub base_url: Option<String>,
}

impl ListingFields {
    /// Overwrite each field with the newer value, but only where the newer
    /// value is present.
    pub fn merge_present(&mut self, newer: ListingFields) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.title, newer.title);
        take(&mut self.current_price, newer.current_price);
        take(&mut self.original_price, newer.original_price);
        take(&mut self.discount, newer.discount);
        take(&mut self.deal_badge, newer.deal_badge);
        take(&mut self.image_url, newer.image_url);
        take(&mut self.product_url, newer.product_url);
        take(&mut self.brand_id, newer.brand_id);
        take(&mut self.category, newer.category);
        take(&mut self.base_url, newer.base_url);
    }

    pub fn watched(&self, field: WatchedField) -> Option<&str> {
        match field {
            WatchedField::CurrentPrice => self.current_price.as_deref(),
            WatchedField::OriginalPrice => self.original_price.as_deref(),
            WatchedField::Discount => self.discount.as_deref(),
            WatchedField::DealBadge => self.deal_badge.as_deref(),
        }
    }
}

/// The proposed next state of one identity, built up during a single cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedListing {
    pub key: IdentityKey,
    pub categories: BTreeSet<String>,
    pub fields: ListingFields,
}

impl AggregatedListing {
    /// Fold a later observation of the same identity into this one
    pub fn absorb(&mut self, newer: AggregatedListing) {
        debug_assert_eq!(self.key, newer.key);
        self.categories.extend(newer.categories);
        self.fields.merge_present(newer.fields);
    }

    pub fn title(&self) -> &str {
        self.fields.title.as_deref().unwrap_or("Amazon Deal")
    }
}
