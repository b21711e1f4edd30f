use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::database::DealStore;
use crate::models::{AggregatedListing, CanonicalRecord, ChangeEvent, IdentityKey, WatchedField};
use crate::utils::error::{AppError, Result};
use crate::utils::with_timeout;

/// Result of reconciling one identity against the store
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub record: CanonicalRecord,
    pub event: Option<ChangeEvent>,
    pub is_new: bool,
}

/// Outcome of reconciling every aggregated listing of a cycle
#[derive(Debug, Default)]
pub struct ReconciliationBatch {
    pub changes: Vec<(AggregatedListing, ChangeEvent)>,
    pub new_by_site: BTreeMap<String, usize>,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<ReconciliationFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    pub key: IdentityKey,
    pub error: String,
}

impl ReconciliationBatch {
    pub fn new_total(&self) -> usize {
        self.new_by_site.values().sum()
    }
}

pub struct ChangeDetector {
    store: Arc<dyn DealStore>,
    watched: Vec<WatchedField>,
    store_timeout: Duration,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn DealStore>, store_timeout: Duration) -> Self {
        Self::with_watched(store, WatchedField::defaults(), store_timeout)
    }

    pub fn with_watched(store: Arc<dyn DealStore>, watched: Vec<WatchedField>, store_timeout: Duration) -> Self {
        Self {
            store,
            watched,
            store_timeout,
        }
    }

    pub fn watched(&self) -> &[WatchedField] {
        &self.watched
    }

    /// Reconcile one aggregated listing against its stored record.
    ///
    /// A first sighting is inserted and classified `New`. A known identity is
    /// always written back so `last_seen` advances, and classified `Updated`
    /// only when a watched field differs.
    pub async fn reconcile(&self, listing: &AggregatedListing, now: DateTime<Utc>) -> Result<Reconciliation> {
        let key = &listing.key;
        let existing = with_timeout(
            format!("find {}", key),
            self.store_timeout,
            self.store.find(key),
        )
        .await?;

        let Some(stored) = existing else {
            let record = CanonicalRecord::discovered(listing, now);
            let written = with_timeout(format!("insert {}", key), self.store_timeout, self.store.insert(&record)).await;
            self.confirm_write(written, &record).await?;
            tracing::debug!("Inserted new deal {}", key);

            return Ok(Reconciliation {
                record,
                event: Some(ChangeEvent::new_deal()),
                is_new: true,
            });
        };

        let next = stored.next_state(listing, now);
        let changed = stored.diff_watched(&next, &self.watched);

        let written = with_timeout(format!("update {}", key), self.store_timeout, self.store.update(&next)).await;
        self.confirm_write(written, &next).await?;

        Ok(Reconciliation {
            record: next,
            event: ChangeEvent::updated(changed),
            is_new: false,
        })
    }

    /// A timed-out write may still have committed. Count it as written when
    /// the store now holds exactly `record`.
    async fn confirm_write(&self, written: Result<()>, record: &CanonicalRecord) -> Result<()> {
        let e = match written {
            Err(e @ AppError::Timeout { .. }) => e,
            other => return other,
        };

        let key = &record.key;
        match with_timeout(format!("find {}", key), self.store_timeout, self.store.find(key)).await {
            Ok(Some(stored)) if stored == *record => {
                tracing::warn!("Write of {} timed out but the record is stored", key);
                Ok(())
            }
            _ => Err(e),
        }
    }

    /// Reconcile a whole cycle. A failure for one identity is logged and
    /// recorded; the remaining identities are still processed and the failed
    /// one is retried from scratch next cycle.
    pub async fn reconcile_all(&self, listings: Vec<AggregatedListing>) -> ReconciliationBatch {
        let mut batch = ReconciliationBatch::default();

        for listing in listings {
            match self.reconcile(&listing, Utc::now()).await {
                Ok(outcome) => {
                    if outcome.is_new {
                        *batch.new_by_site.entry(listing.key.site.clone()).or_insert(0) += 1;
                    }
                    match outcome.event {
                        Some(event) => {
                            if !outcome.is_new {
                                batch.updated += 1;
                            }
                            batch.changes.push((listing, event));
                        }
                        None => batch.unchanged += 1,
                    }
                }
                Err(e) => {
                    let error = AppError::Reconciliation {
                        key: listing.key.clone(),
                        message: e.to_string(),
                    };
                    tracing::error!("{}", error);
                    batch.failures.push(ReconciliationFailure {
                        key: listing.key,
                        error: e.to_string(),
                    });
                }
            }
        }

        batch
    }
}
