// Integration tests for Deal Watcher
// These tests drive whole cycles through fake collaborators

pub mod cycle_tests;
pub mod delivery_tests;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deal_watcher::config::{DatabaseConfig, SiteConfig};
use deal_watcher::{
    AppError, ChangeDetector, CycleOrchestrator, CycleSettings, DealScraper, MemoryDealStore, NotificationEvent,
    NotificationResult, NotifierPlugin, RawListing, Result, ScrapeTarget, SqliteDealStore,
};

pub const MARKETPLACE: &str = "A1RKKUPIHCS9HS";

/// Settings with no pacing so tests run fast
pub fn test_settings() -> CycleSettings {
    CycleSettings {
        category_delay: Duration::ZERO,
        site_delay: Duration::ZERO,
        notification_delay: Duration::ZERO,
        rate_limit_retry: Duration::from_millis(10),
        scrape_timeout: Duration::from_secs(5),
        notify_timeout: Duration::from_secs(5),
    }
}

pub fn test_site(name: &str, categories: &[&str]) -> SiteConfig {
    SiteConfig {
        name: name.to_string(),
        base_url: "https://www.amazon.es/-/en/deals".to_string(),
        marketplace_id: MARKETPLACE.to_string(),
        categories: categories.iter().map(|c| c.to_string()).collect(),
        scrape_all: false,
    }
}

pub fn raw(asin: &str, price: Option<&str>) -> RawListing {
    RawListing {
        asin: Some(asin.to_string()),
        title: Some(format!("Deal {}", asin)),
        current_price: price.map(str::to_string),
        product_url: Some(format!("https://www.amazon.es/dp/{}", asin)),
        ..Default::default()
    }
}

pub async fn sqlite_store() -> anyhow::Result<Arc<SqliteDealStore>> {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        acquire_timeout: 5,
    };
    Ok(Arc::new(SqliteDealStore::connect(&config).await?))
}

/// Scraper serving canned listings per category
#[derive(Default)]
pub struct FakeScraper {
    listings: Mutex<HashMap<String, Vec<RawListing>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, category: &str, listings: Vec<RawListing>) {
        self.listings.lock().unwrap().insert(category.to_string(), listings);
    }

    pub fn fail(&self, category: &str) {
        self.failing.lock().unwrap().insert(category.to_string());
    }

    pub fn recover(&self, category: &str) {
        self.failing.lock().unwrap().remove(category);
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DealScraper for FakeScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<Vec<RawListing>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&target.category) {
            return Err(AppError::Scraping(format!("{}: page crashed", target.category)));
        }

        let mut listings = self
            .listings
            .lock()
            .unwrap()
            .get(&target.category)
            .cloned()
            .unwrap_or_default();
        for listing in &mut listings {
            listing.category = Some(target.category.clone());
        }
        Ok(listings)
    }
}

/// Notifier that records every event and can be told to fail
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationEvent>>,
    attempts: AtomicUsize,
    rate_limited_attempts: AtomicUsize,
    broken: Mutex<bool>,
    stalled: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `count` attempts with a rate limit
    pub fn rate_limit_next(&self, count: usize) {
        self.rate_limited_attempts.store(count, Ordering::SeqCst);
    }

    pub fn break_delivery(&self) {
        *self.broken.lock().unwrap() = true;
    }

    /// Never answer in time for this item
    pub fn stall_on(&self, item_id: &str) {
        self.stalled.lock().unwrap().insert(item_id.to_string());
    }

    pub fn sent(&self) -> Vec<NotificationEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotifierPlugin for RecordingNotifier {
    fn name(&self) -> &str {
        "Recording Notifier"
    }

    fn plugin_type(&self) -> &str {
        "recording"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationResult> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let limited = self
            .rate_limited_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(AppError::RateLimited { retry_after: Some(0.01) });
        }

        let stalled = self.stalled.lock().unwrap().contains(&event.listing.key.item_id);
        if stalled {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        if *self.broken.lock().unwrap() {
            return Err(AppError::Delivery("Discord returned 500".to_string()));
        }

        self.sent.lock().unwrap().push(event.clone());
        Ok(NotificationResult::delivered(None))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub struct TestHarness {
    pub scraper: Arc<FakeScraper>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemoryDealStore>,
    pub orchestrator: Arc<CycleOrchestrator>,
}

/// Orchestrator over an in-memory store
pub fn create_harness(sites: Vec<SiteConfig>) -> TestHarness {
    create_harness_with(sites, test_settings())
}

pub fn create_harness_with(sites: Vec<SiteConfig>, settings: CycleSettings) -> TestHarness {
    let scraper = Arc::new(FakeScraper::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let store = Arc::new(MemoryDealStore::new());

    let orchestrator = Arc::new(CycleOrchestrator::new(
        sites,
        scraper.clone(),
        ChangeDetector::new(store.clone(), Duration::from_secs(5)),
        notifier.clone(),
        settings,
    ));

    TestHarness {
        scraper,
        notifier,
        store,
        orchestrator,
    }
}
