use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine;
use headless_chrome::browser::tab::ResponseHandler;
use headless_chrome::protocol::cdp::Network::GetResponseBodyReturnObject;
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

use crate::config::ScraperConfig;
use crate::models::{RawListing, ScrapeTarget};
use crate::utils::error::{AppError, Result};

pub const DEFAULT_MARKETPLACE_ID: &str = "A1RKKUPIHCS9HS";
pub const DEFAULT_BASE_URL: &str = "https://www.amazon.es/-/en/deals";

/// Category buttons as labelled on the deals page
pub const CATEGORY_CATALOG: [&str; 31] = [
    "Featured Deals",
    "Trending Deals",
    "Lightning Deals",
    "Deals under 20€",
    "Amazon Devices",
    "Prime Exclusive",
    "Computer & Software",
    "TV, Movies & Home Cinema",
    "Fashion, Shoes & Bags",
    "Home & Kitchen",
    "Phone & Accessories",
    "Personal Care & Grooming",
    "Headphones, Speakers & Music",
    "Sports & Fitness",
    "Gaming & Accessories",
    "Pet products",
    "Beauty",
    "DIY & Tools",
    "Toys",
    "Baby",
    "Office & School Supplies",
    "Cameras",
    "Food & Drinks",
    "Watches & Jewellery",
    "Furniture",
    "Luggage & Backpack",
    "Car & Motorbike",
    "Garden & Outdoors",
    "Books",
    "Vouchers",
    "Outlet",
];

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

const LOAD_MORE_SCRIPT: &str = r#"
(() => {
    const visible = (el) => !!(el && (el.offsetWidth || el.offsetHeight || el.getClientRects().length));
    const candidates = [
        ...document.querySelectorAll('[data-testid="load-more-view-more-button"]'),
        ...document.querySelectorAll('button[aria-label*="Show more"], a[aria-label*="Show more"]'),
        ...Array.from(document.querySelectorAll('button')).filter((b) => {
            const text = (b.innerText || '').trim();
            return text === 'View more deals' || text === 'Show more';
        }),
    ];
    const button = candidates.find(visible);
    if (button) {
        button.click();
        return true;
    }
    window.scrollBy(0, window.innerHeight * 2);
    return false;
})()
"#;

/// Source of raw listings for one (site, category)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DealScraper: Send + Sync {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<Vec<RawListing>>;
}

/// Hosts derived from a site's deals page URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionEndpoint {
    pub api_url: String,
    pub domain_host: String,
}

impl PromotionEndpoint {
    pub fn from_target(target: &ScrapeTarget) -> Result<Self> {
        let url = Url::parse(&target.base_url)
            .map_err(|e| AppError::Scraping(format!("Invalid base URL '{}': {}", target.base_url, e)))?;
        let host = url.host_str().unwrap_or("www.amazon.es").to_lowercase();

        let api_host = if host.starts_with("data.") {
            host.clone()
        } else if let Some(rest) = host.strip_prefix("www.") {
            format!("data.{}", rest)
        } else {
            format!("data.{}", host)
        };

        let domain_host = match host.strip_prefix("data.") {
            Some(rest) => format!("www.{}", rest),
            None => host,
        };

        Ok(Self {
            api_url: format!("https://{}/api/marketplaces/{}/promotions", api_host, target.marketplace_id),
            domain_host,
        })
    }
}

fn text_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read one promotion element from the API payload
pub fn parse_promotion(promotion: &Value, endpoint: &PromotionEndpoint, target: &ScrapeTarget) -> Option<RawListing> {
    let product = promotion.pointer("/product/entity")?;
    let asin = text_at(product, "/asin");
    let option = product.pointer("/buyingOptions/0");

    let amount = |path: &str| {
        option
            .and_then(|o| text_at(o, path))
            .map(|amount| format!("€{}", amount))
    };

    let current_price = amount("/price/entity/priceToPay/moneyValueOrRange/value/amount");
    let original_price = amount("/price/entity/basisPrice/moneyValueOrRange/value/amount");
    let discount = option
        .and_then(|o| text_at(o, "/price/entity/savings/percentage/value"))
        .map(|value| format!("{}%", value));
    let deal_badge = option.and_then(|o| text_at(o, "/dealBadge/entity/label/content/fragments/0/text"));

    let image_url = text_at(product, "/productImages/entity/images/0/lowRes/physicalId")
        .map(|id| format!("https://m.media-amazon.com/images/I/{}._AC_SF226,226_QL85_.jpg", id));
    let product_url = asin
        .as_ref()
        .map(|asin| format!("https://{}/dp/{}", endpoint.domain_host, asin));

    Some(RawListing {
        title: text_at(product, "/title/entity/displayString"),
        current_price,
        original_price,
        discount,
        deal_badge,
        image_url,
        product_url,
        brand_id: text_at(promotion, "/brandId"),
        category: Some(target.category.clone()),
        marketplace_id: Some(target.marketplace_id.clone()),
        site: Some(target.site.clone()),
        base_url: Some(target.base_url.clone()),
        asin,
    })
}

/// Every listing in one intercepted promotions response
pub fn parse_promotions(body: &Value, endpoint: &PromotionEndpoint, target: &ScrapeTarget) -> Vec<RawListing> {
    body.pointer("/entity/rankedPromotions")
        .and_then(Value::as_array)
        .map(|promotions| {
            promotions
                .iter()
                .filter_map(|promotion| parse_promotion(promotion, endpoint, target))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreStep {
    Continue,
    Exhausted,
    PageLimit,
}

/// Stop rule for the load-more loop: a bounded run of attempts that yield
/// nothing new, or an optional page cap
#[derive(Debug)]
pub struct LoadMoreTracker {
    max_no_new_attempts: u32,
    max_pages: Option<u32>,
    no_new_attempts: u32,
    previous_count: usize,
    page: u32,
}

impl LoadMoreTracker {
    pub fn new(max_no_new_attempts: u32, max_pages: Option<u32>, initial_count: usize) -> Self {
        Self {
            max_no_new_attempts,
            max_pages,
            no_new_attempts: 0,
            previous_count: initial_count,
            page: 1,
        }
    }

    /// Record the item count after one load-more attempt
    pub fn observe(&mut self, count: usize) -> LoadMoreStep {
        if count > self.previous_count {
            tracing::debug!("Found {} new listings (total {})", count - self.previous_count, count);
            self.no_new_attempts = 0;
        } else {
            self.no_new_attempts += 1;
            tracing::debug!("No new listings ({}/{})", self.no_new_attempts, self.max_no_new_attempts);
            if self.no_new_attempts >= self.max_no_new_attempts {
                return LoadMoreStep::Exhausted;
            }
        }

        self.previous_count = count;
        self.page += 1;

        match self.max_pages {
            Some(max) if self.page > max => LoadMoreStep::PageLimit,
            _ => LoadMoreStep::Continue,
        }
    }
}

/// Stop signal shared between an async scrape call and its browser thread
#[derive(Debug, Clone, Default)]
struct ScrapeCancel(Arc<AtomicBool>);

impl ScrapeCancel {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(anyhow!("Scrape cancelled"));
        }
        Ok(())
    }

    /// Sleep in short slices, failing as soon as the scrape is cancelled
    fn pause(&self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// Cancels the scrape when dropped
struct CancelOnDrop(ScrapeCancel);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run browser work on the blocking pool. Dropping the returned future, as a
/// timeout does, cancels the work at its next checkpoint.
async fn run_cancellable<T, F>(work: F) -> Result<anyhow::Result<T>>
where
    T: Send + 'static,
    F: FnOnce(ScrapeCancel) -> anyhow::Result<T> + Send + 'static,
{
    let cancel = ScrapeCancel::default();
    let _guard = CancelOnDrop(cancel.clone());

    tokio::task::spawn_blocking(move || work(cancel))
        .await
        .map_err(|e| AppError::Scraping(format!("Scrape task failed: {}", e)))
}

/// Scraper that drives headless Chrome and intercepts the promotions API
#[derive(Clone)]
pub struct ChromeDealScraper {
    config: Arc<ScraperConfig>,
    // Held for a whole browser session so sessions never overlap
    session: Arc<Mutex<()>>,
}

impl ChromeDealScraper {
    pub fn new(config: ScraperConfig) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(Mutex::new(())),
        }
    }

    fn launch(&self) -> anyhow::Result<Browser> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .idle_browser_timeout(Duration::from_secs(self.config.navigation_timeout.max(60)))
            .args(vec![
                std::ffi::OsStr::new("--no-sandbox"),
                std::ffi::OsStr::new("--disable-dev-shm-usage"),
                std::ffi::OsStr::new("--disable-gpu"),
                std::ffi::OsStr::new("--disable-extensions"),
            ])
            .build()
            .map_err(|e| anyhow!("Failed to create launch options: {}", e))?;

        if let Some(chrome_path) = &self.config.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(chrome_path));
        }

        Browser::new(launch_options).map_err(|e| anyhow!("Failed to launch browser: {}", e))
    }

    fn scrape_blocking(&self, target: &ScrapeTarget, cancel: &ScrapeCancel) -> anyhow::Result<Vec<RawListing>> {
        let _session = self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cancel.check()?;

        let endpoint = PromotionEndpoint::from_target(target).map_err(|e| anyhow!(e.to_string()))?;
        let browser = self.launch()?;
        let tab = browser.new_tab().map_err(|e| anyhow!("Failed to create tab: {}", e))?;

        let collected: Arc<Mutex<Vec<RawListing>>> = Arc::new(Mutex::new(Vec::new()));
        let result = self.drive(&tab, endpoint, target, &collected, cancel);

        // Dropping the browser afterwards shuts Chrome down
        let _ = tab.close(false);
        result?;

        let listings = collected.lock().map_err(|_| anyhow!("listing buffer poisoned"))?.clone();
        Ok(listings)
    }

    fn drive(
        &self,
        tab: &Tab,
        endpoint: PromotionEndpoint,
        target: &ScrapeTarget,
        collected: &Arc<Mutex<Vec<RawListing>>>,
        cancel: &ScrapeCancel,
    ) -> anyhow::Result<()> {
        tab.set_user_agent(&self.config.user_agent, None, None)
            .map_err(|e| anyhow!("Failed to set user agent: {}", e))?;
        tab.set_default_timeout(Duration::from_secs(self.config.navigation_timeout));

        tab.register_response_handling("promotions", intercept(endpoint, target.clone(), collected.clone()))
            .map_err(|e| anyhow!("Failed to register response handler: {}", e))?;

        tracing::debug!("Loading deals page {}", target.base_url);
        tab.navigate_to(&target.base_url)
            .map_err(|e| anyhow!("Navigation failed: {}", e))?;
        tab.wait_until_navigated()
            .map_err(|e| anyhow!("Page load failed: {}", e))?;
        cancel.check()?;

        self.select_category(tab, &target.category, cancel)?;
        cancel.pause(Duration::from_millis(self.config.initial_wait_ms))?;

        let count = |collected: &Mutex<Vec<RawListing>>| -> anyhow::Result<usize> {
            Ok(collected.lock().map_err(|_| anyhow!("listing buffer poisoned"))?.len())
        };

        let mut tracker = LoadMoreTracker::new(
            self.config.max_no_new_attempts,
            self.config.max_pages,
            count(collected)?,
        );

        loop {
            cancel.check()?;
            let clicked = tab
                .evaluate(LOAD_MORE_SCRIPT, false)
                .map(|result| result.value.and_then(|v| v.as_bool()).unwrap_or(false))
                .unwrap_or(false);
            if clicked {
                tracing::debug!("Clicked load more in '{}'", target.category);
            }
            cancel.pause(Duration::from_millis(self.config.load_more_wait_ms))?;

            match tracker.observe(count(collected)?) {
                LoadMoreStep::Continue => continue,
                LoadMoreStep::Exhausted => {
                    tracing::debug!("Reached end of available deals in '{}'", target.category);
                    return Ok(());
                }
                LoadMoreStep::PageLimit => {
                    tracing::debug!("Reached page limit in '{}'", target.category);
                    return Ok(());
                }
            }
        }
    }

    fn select_category(&self, tab: &Tab, category: &str, cancel: &ScrapeCancel) -> anyhow::Result<()> {
        let label = serde_json::to_string(category)?;
        let script = format!(
            r#"(() => {{
                const wanted = {}.toLowerCase();
                const button = Array.from(document.querySelectorAll('button'))
                    .find((b) => (b.innerText || '').trim().toLowerCase().includes(wanted));
                if (!button) return false;
                button.click();
                return true;
            }})()"#,
            label
        );

        let clicked = tab
            .evaluate(&script, false)
            .map_err(|e| anyhow!("Failed to select category: {}", e))?
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !clicked {
            return Err(anyhow!("Category button '{}' not found", category));
        }

        cancel.pause(Duration::from_millis(self.config.category_settle_ms))
    }
}

fn intercept(endpoint: PromotionEndpoint, target: ScrapeTarget, collected: Arc<Mutex<Vec<RawListing>>>) -> ResponseHandler {
    Box::new(
        move |params: ResponseReceivedEventParams,
              fetch_body: &dyn Fn() -> anyhow::Result<GetResponseBodyReturnObject>| {
            if !params.response.url.contains(&endpoint.api_url) || params.response.status != 200 {
                return;
            }

            let Ok(body) = fetch_body() else {
                return;
            };
            let text = if body.base_64_encoded {
                match base64::engine::general_purpose::STANDARD.decode(body.body.as_bytes()) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => return,
                }
            } else {
                body.body
            };

            let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                return;
            };
            let listings = parse_promotions(&payload, &endpoint, &target);
            tracing::debug!("Intercepted {} deals from page", listings.len());

            if let Ok(mut collected) = collected.lock() {
                collected.extend(listings);
            }
        },
    )
}

#[async_trait]
impl DealScraper for ChromeDealScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<Vec<RawListing>> {
        let scraper = self.clone();
        let target = target.clone();
        let category = target.category.clone();

        let listings = run_cancellable(move |cancel| scraper.scrape_blocking(&target, &cancel))
            .await?
            .map_err(|e| AppError::Scraping(format!("{}: {}", category, e)))?;

        tracing::info!("Scraped {} listings from '{}'", listings.len(), category);
        Ok(listings)
    }
}
