use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{AggregatedListing, FieldChange, IdentityKey, ListingFields, WatchedField};

/// The persisted, authoritative state of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: IdentityKey,

    // Every category label ever observed; only grows
    pub categories: BTreeSet<String>,
    pub fields: ListingFields,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Record for an identity seen for the first time
    pub fn discovered(listing: &AggregatedListing, now: DateTime<Utc>) -> Self {
        Self {
            key: listing.key.clone(),
            categories: listing.categories.clone(),
            fields: listing.fields.clone(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Next persisted state after this cycle's observation. Absent values in
    /// the observation keep what is already stored.
    pub fn next_state(&self, listing: &AggregatedListing, now: DateTime<Utc>) -> Self {
        let mut categories = self.categories.clone();
        categories.extend(listing.categories.iter().cloned());

        let mut fields = self.fields.clone();
        fields.merge_present(listing.fields.clone());

        Self {
            key: self.key.clone(),
            categories,
            fields,
            first_seen: self.first_seen,
            last_seen: now,
        }
    }

    /// Watched fields that differ between this record and `next`
    pub fn diff_watched(&self, next: &CanonicalRecord, watched: &[WatchedField]) -> BTreeMap<WatchedField, FieldChange> {
        watched
            .iter()
            .filter_map(|field| {
                let old = self.fields.watched(*field);
                let new = next.fields.watched(*field);
                (old != new).then(|| {
                    (
                        *field,
                        FieldChange {
                            old: old.map(str::to_string),
                            new: new.map(str::to_string),
                        },
                    )
                })
            })
            .collect()
    }
}
