use std::collections::HashMap;

use crate::models::{AggregatedListing, IdentityKey};

/// Merges every normalized listing seen during one cycle, keyed by identity.
///
/// The final category set of an identity does not depend on arrival order.
/// Field values do: the latest present value wins and absent values never
/// replace a known one.
#[derive(Debug, Default)]
pub struct RunAggregator {
    listings: Vec<AggregatedListing>,
    index: HashMap<IdentityKey, usize>,
    observed: usize,
}

impl RunAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation into the run
    pub fn add(&mut self, listing: AggregatedListing) {
        self.observed += 1;

        match self.index.get(&listing.key) {
            Some(&position) => self.listings[position].absorb(listing),
            None => {
                self.index.insert(listing.key.clone(), self.listings.len());
                self.listings.push(listing);
            }
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&AggregatedListing> {
        self.index.get(key).map(|&position| &self.listings[position])
    }

    /// Number of unique identities
    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    /// Number of observations folded in, duplicates included
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Aggregated listings in order of first sighting
    pub fn into_listings(self) -> Vec<AggregatedListing> {
        self.listings
    }
}

impl Extend<AggregatedListing> for RunAggregator {
    fn extend<I: IntoIterator<Item = AggregatedListing>>(&mut self, iter: I) {
        for listing in iter {
            self.add(listing);
        }
    }
}
