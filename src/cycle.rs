use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use uuid::Uuid;

use crate::aggregator::RunAggregator;
use crate::change_detector::{ChangeDetector, ReconciliationFailure};
use crate::config::{CycleConfig, SiteConfig};
use crate::models::{AggregatedListing, ChangeEvent, ScrapeTarget};
use crate::normalizer::normalize;
use crate::plugins::{NotificationEvent, NotificationResult, NotifierPlugin};
use crate::scraper::DealScraper;
use crate::utils::error::{AppError, Result};
use crate::utils::with_timeout;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Scraping,
    Aggregating,
    Reconciling,
    Notifying,
}

/// Pacing and timeouts for one cycle
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub category_delay: Duration,
    pub site_delay: Duration,
    pub notification_delay: Duration,
    pub rate_limit_retry: Duration,
    pub scrape_timeout: Duration,
    pub notify_timeout: Duration,
}

impl From<&CycleConfig> for CycleSettings {
    fn from(config: &CycleConfig) -> Self {
        Self {
            category_delay: Duration::from_millis(config.category_delay_ms),
            site_delay: Duration::from_millis(config.site_delay_ms),
            notification_delay: Duration::from_millis(config.notification_delay_ms),
            rate_limit_retry: Duration::from_millis(config.rate_limit_retry_ms),
            scrape_timeout: Duration::from_secs(config.scrape_timeout_secs),
            notify_timeout: Duration::from_secs(config.notify_timeout_secs),
        }
    }
}

/// Result of scraping one (site, category)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitOutcome {
    pub site: String,
    pub category: String,
    pub listings: usize,
    pub error: Option<String>,
}

impl UnitOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub reason: String,
    pub outcomes: Vec<UnitOutcome>,
    pub scraped: usize,
    pub discarded: usize,
    pub unique: usize,
    pub new_by_site: BTreeMap<String, usize>,
    pub updated: usize,
    pub unchanged: usize,
    pub reconciliation_failures: Vec<ReconciliationFailure>,
    pub delivered: usize,
    pub dropped: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn start(reason: &str) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            reason: reason.to_string(),
            outcomes: Vec::new(),
            scraped: 0,
            discarded: 0,
            unique: 0,
            new_by_site: BTreeMap::new(),
            updated: 0,
            unchanged: 0,
            reconciliation_failures: Vec::new(),
            delivered: 0,
            dropped: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn new_total(&self) -> usize {
        self.new_by_site.values().sum()
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.succeeded())
    }
}

/// Drives scrape, aggregate, reconcile and notify for every configured site.
///
/// Only one cycle runs at a time; a trigger that arrives while a cycle is in
/// progress is skipped.
pub struct CycleOrchestrator {
    sites: Vec<SiteConfig>,
    scraper: Arc<dyn DealScraper>,
    detector: ChangeDetector,
    notifier: Arc<dyn NotifierPlugin>,
    settings: CycleSettings,
    phase: RwLock<CyclePhase>,
    running: Mutex<()>,
    completed_cycles: AtomicU64,
    skipped_cycles: AtomicU64,
    last_report: RwLock<Option<CycleReport>>,
}

impl CycleOrchestrator {
    pub fn new(
        sites: Vec<SiteConfig>,
        scraper: Arc<dyn DealScraper>,
        detector: ChangeDetector,
        notifier: Arc<dyn NotifierPlugin>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            sites,
            scraper,
            detector,
            notifier,
            settings,
            phase: RwLock::new(CyclePhase::Idle),
            running: Mutex::new(()),
            completed_cycles: AtomicU64::new(0),
            skipped_cycles: AtomicU64::new(0),
            last_report: RwLock::new(None),
        }
    }

    pub async fn phase(&self) -> CyclePhase {
        *self.phase.read().await
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Relaxed)
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles.load(Ordering::Relaxed)
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    async fn enter(&self, phase: CyclePhase) {
        *self.phase.write().await = phase;
        tracing::debug!("Cycle phase: {:?}", phase);
    }

    /// Run one full cycle. Returns `None` when another cycle is already running.
    pub async fn run_cycle(&self, reason: &str) -> Option<CycleReport> {
        let Ok(_guard) = self.running.try_lock() else {
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("deal_cycles_skipped_total").increment(1);
            tracing::warn!("Skipping '{}': a sync is already in progress", reason);
            return None;
        };

        let started = Instant::now();
        let mut report = CycleReport::start(reason);
        tracing::info!("Starting sync ({}) [{}]", reason, report.cycle_id);

        self.enter(CyclePhase::Scraping).await;
        let aggregator = self.scrape_all(&mut report).await;

        self.enter(CyclePhase::Aggregating).await;
        report.unique = aggregator.len();
        let listings = aggregator.into_listings();
        tracing::info!("Aggregated {} unique deals from {} listings", report.unique, report.scraped);

        self.enter(CyclePhase::Reconciling).await;
        let batch = self.detector.reconcile_all(listings).await;
        for (site, count) in &batch.new_by_site {
            tracing::info!("[{}] {} new deals discovered", site, count);
        }
        report.new_by_site = batch.new_by_site;
        report.updated = batch.updated;
        report.unchanged = batch.unchanged;
        report.reconciliation_failures = batch.failures;

        self.enter(CyclePhase::Notifying).await;
        self.notify_all(batch.changes, &mut report).await;

        self.enter(CyclePhase::Idle).await;
        report.duration = started.elapsed();
        self.record(&report);

        tracing::info!(
            "Sync complete ({}): {} new, {} updated, {} unchanged, {} delivered, {} dropped in {:.1}s",
            reason,
            report.new_total(),
            report.updated,
            report.unchanged,
            report.delivered,
            report.dropped,
            report.duration.as_secs_f64()
        );

        self.completed_cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_report.write().await = Some(report.clone());
        Some(report)
    }

    async fn scrape_all(&self, report: &mut CycleReport) -> RunAggregator {
        let mut aggregator = RunAggregator::new();

        for (index, site) in self.sites.iter().enumerate() {
            let categories = site.categories_to_scrape();
            if categories.is_empty() {
                tracing::warn!("[{}] No categories configured, skipping site", site.name);
                continue;
            }

            tracing::info!("[{}] Scraping {} categories", site.name, categories.len());
            for category in &categories {
                let target = site.target(category);
                let outcome = self.scrape_unit(&target, &mut aggregator, report).await;
                report.outcomes.push(outcome);
                tokio::time::sleep(self.settings.category_delay).await;
            }

            if index + 1 < self.sites.len() {
                tokio::time::sleep(self.settings.site_delay).await;
            }
        }

        aggregator
    }

    async fn scrape_unit(
        &self,
        target: &ScrapeTarget,
        aggregator: &mut RunAggregator,
        report: &mut CycleReport,
    ) -> UnitOutcome {
        let operation = format!("scrape of '{}' on {}", target.category, target.site);
        let result = with_timeout(operation, self.settings.scrape_timeout, self.scraper.scrape(target)).await;

        match result {
            Ok(raw_listings) => {
                let count = raw_listings.len();
                report.scraped += count;

                for raw in raw_listings {
                    match normalize(raw, target) {
                        Ok(listing) => aggregator.add(listing),
                        Err(e) => {
                            report.discarded += 1;
                            tracing::debug!("Discarding listing: {}", e);
                        }
                    }
                }

                tracing::debug!("[{}] '{}' yielded {} listings", target.site, target.category, count);
                UnitOutcome {
                    site: target.site.clone(),
                    category: target.category.clone(),
                    listings: count,
                    error: None,
                }
            }
            Err(e) => {
                metrics::counter!("deal_scrape_failures_total").increment(1);
                tracing::error!("[{}] Failed to scrape '{}': {}", target.site, target.category, e);
                UnitOutcome {
                    site: target.site.clone(),
                    category: target.category.clone(),
                    listings: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn notify_all(&self, changes: Vec<(AggregatedListing, ChangeEvent)>, report: &mut CycleReport) {
        for (listing, change) in changes {
            let event = NotificationEvent::new(listing, change);

            match self.deliver(&event).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    report.dropped += 1;
                    tracing::error!("Dropping notification for {}: {}", event.listing.key, e);
                }
            }

            tokio::time::sleep(self.settings.notification_delay).await;
        }
    }

    /// Send one notification, retrying once after a fixed delay when rate limited
    async fn deliver(&self, event: &NotificationEvent) -> Result<NotificationResult> {
        let strategy = FixedInterval::new(self.settings.rate_limit_retry).take(1);

        RetryIf::start(
            strategy,
            || self.send_once(event),
            |e: &AppError| {
                let retry = e.is_rate_limited();
                if retry {
                    tracing::warn!(
                        "Hit rate limit, waiting {:?} before retry",
                        self.settings.rate_limit_retry
                    );
                }
                retry
            },
        )
        .await
    }

    async fn send_once(&self, event: &NotificationEvent) -> Result<NotificationResult> {
        with_timeout(
            format!("notification for {}", event.listing.key),
            self.settings.notify_timeout,
            self.notifier.notify(event),
        )
        .await
    }

    fn record(&self, report: &CycleReport) {
        metrics::counter!("deal_cycles_total").increment(1);
        metrics::counter!("deal_listings_scraped_total").increment(report.scraped as u64);
        metrics::counter!("deal_new_total").increment(report.new_total() as u64);
        metrics::counter!("deal_updated_total").increment(report.updated as u64);
        metrics::counter!("deal_reconciliation_failures_total").increment(report.reconciliation_failures.len() as u64);
        metrics::counter!("deal_notifications_delivered_total").increment(report.delivered as u64);
        metrics::counter!("deal_notifications_dropped_total").increment(report.dropped as u64);
        metrics::gauge!("deal_last_cycle_unique").set(report.unique as f64);
        metrics::histogram!("deal_cycle_duration_seconds").record(report.duration.as_secs_f64());
    }
}
