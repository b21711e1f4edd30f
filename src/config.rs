use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::Path;
use url::Url;

use crate::models::ScrapeTarget;
use crate::scraper::{CATEGORY_CATALOG, DEFAULT_BASE_URL, DEFAULT_MARKETPLACE_ID};
use crate::utils::error::{AppError, Result};

pub const DEFAULT_SITE_NAME: &str = "Amazon Spain";
pub const FALLBACK_SITE_NAME: &str = "Amazon Site";
pub const DEFAULT_CATEGORIES: [&str; 3] = ["Beauty", "Computer & Software", "Gaming & Accessories"];
pub const DEFAULT_DISCORD_API: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    pub database: DatabaseConfig,
    pub scraper: ScraperConfig,
    pub scheduler: SchedulerConfig,
    pub cycle: CycleConfig,
    pub sites_file: String,
    pub log_dir: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    pub channel_id: u64,
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub chrome_path: Option<String>,
    pub user_agent: String,
    pub navigation_timeout: u64,
    pub category_settle_ms: u64,
    pub initial_wait_ms: u64,
    pub load_more_wait_ms: u64,
    pub max_no_new_attempts: u32,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Six-field cron expression (seconds first)
    pub schedule: String,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    pub category_delay_ms: u64,
    pub site_delay_ms: u64,
    pub notification_delay_ms: u64,
    pub rate_limit_retry_ms: u64,
    pub scrape_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub notify_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Tunables {
    sites_file: String,
    log_dir: Option<String>,
    metrics_port: Option<u16>,
    database: DatabaseTunables,
    discord: DiscordTunables,
    scraper: ScraperConfig,
    scheduler: SchedulerConfig,
    cycle: CycleConfig,
}

#[derive(Debug, Deserialize)]
struct DatabaseTunables {
    max_connections: u32,
    acquire_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct DiscordTunables {
    api_base: String,
}

/// Process inputs that have no sensible default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secrets {
    pub discord_token: String,
    pub channel_id: u64,
    pub database_url: String,
}

impl Secrets {
    pub const REQUIRED: [&'static str; 3] = ["DISCORD_TOKEN", "DISCORD_CHANNEL_ID", "DATABASE_URL"];

    /// Read every required variable, reporting all missing ones at once
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let [token, channel_raw, database_url] = Self::REQUIRED.map(read);

        let missing: Vec<&str> = Self::REQUIRED
            .iter()
            .zip([&token, &channel_raw, &database_url])
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();

        let (Some(discord_token), Some(channel_raw), Some(database_url)) = (token, channel_raw, database_url) else {
            return Err(AppError::InvalidConfig(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        let channel_id = channel_raw
            .trim()
            .parse::<u64>()
            .map_err(|_| AppError::InvalidConfig("DISCORD_CHANNEL_ID must be an integer".to_string()))?;

        if !database_url.starts_with("sqlite:") {
            return Err(AppError::InvalidConfig(
                "DATABASE_URL must be a sqlite connection string".to_string(),
            ));
        }

        Ok(Self {
            discord_token,
            channel_id,
            database_url,
        })
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let secrets = Secrets::from_lookup(|name| env::var(name).ok())?;

        let settings = Self::defaults()?
            // Tunables as DEALS_<KEY> or DEALS_<SECTION>__<KEY>
            .add_source(
                Environment::with_prefix("DEALS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::assemble(secrets, settings.try_deserialize()?)
    }

    /// Configuration built from the defaults only
    pub fn with_defaults(secrets: Secrets) -> Result<Self> {
        let settings = Self::defaults()?.build()?;
        Self::assemble(secrets, settings.try_deserialize()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            .set_default("sites_file", "config.json")?
            .set_default("database.max_connections", 5_i64)?
            .set_default("database.acquire_timeout", 30_i64)?
            .set_default("discord.api_base", DEFAULT_DISCORD_API)?
            .set_default("scraper.user_agent", "Mozilla/5.0 (X11; Linux x86_64) DealWatcher/0.1")?
            .set_default("scraper.navigation_timeout", 30_i64)?
            .set_default("scraper.category_settle_ms", 3000_i64)?
            .set_default("scraper.initial_wait_ms", 5000_i64)?
            .set_default("scraper.load_more_wait_ms", 3000_i64)?
            .set_default("scraper.max_no_new_attempts", 3_i64)?
            .set_default("scheduler.schedule", "0 0 * * * *")?
            .set_default("scheduler.run_on_startup", true)?
            .set_default("cycle.category_delay_ms", 2000_i64)?
            .set_default("cycle.site_delay_ms", 5000_i64)?
            .set_default("cycle.notification_delay_ms", 500_i64)?
            .set_default("cycle.rate_limit_retry_ms", 5000_i64)?
            .set_default("cycle.scrape_timeout_secs", 600_i64)?
            .set_default("cycle.store_timeout_secs", 30_i64)?
            .set_default("cycle.notify_timeout_secs", 30_i64)?;
        Ok(builder)
    }

    fn assemble(secrets: Secrets, tunables: Tunables) -> Result<Self> {
        let config = AppConfig {
            discord: DiscordConfig {
                token: secrets.discord_token,
                channel_id: secrets.channel_id,
                api_base: tunables.discord.api_base,
            },
            database: DatabaseConfig {
                url: secrets.database_url,
                max_connections: tunables.database.max_connections,
                acquire_timeout: tunables.database.acquire_timeout,
            },
            scraper: tunables.scraper,
            scheduler: tunables.scheduler,
            cycle: tunables.cycle,
            sites_file: tunables.sites_file,
            log_dir: tunables.log_dir,
            metrics_port: tunables.metrics_port,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if Url::parse(&self.discord.api_base).is_err() {
            return Err(AppError::InvalidConfig("Invalid Discord API base URL".into()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::InvalidConfig(
                "Database max_connections must be greater than 0".into(),
            ));
        }

        if self.scraper.max_no_new_attempts == 0 {
            return Err(AppError::InvalidConfig(
                "Scraper max_no_new_attempts must be greater than 0".into(),
            ));
        }

        if !is_valid_cron(&self.scheduler.schedule) {
            return Err(AppError::InvalidConfig(
                "Invalid cron expression in scheduler.schedule".into(),
            ));
        }

        if self.cycle.scrape_timeout_secs == 0 || self.cycle.store_timeout_secs == 0 || self.cycle.notify_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("Cycle timeouts must be greater than 0".into()));
        }

        Ok(())
    }
}

/// Basic validation of a six-part cron expression (sec min hour day month weekday)
pub fn is_valid_cron(expression: &str) -> bool {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 6 {
        return false;
    }

    // Allow numbers, ranges, lists, wildcards, and steps
    parts.iter().all(|part| {
        part.chars()
            .all(|c| c.is_ascii_digit() || c == '*' || c == '-' || c == ',' || c == '/' || c == '?')
    })
}

/// One site to scrape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub base_url: String,
    pub marketplace_id: String,
    pub categories: Vec<String>,
    #[serde(default)]
    pub scrape_all: bool,
}

impl SiteConfig {
    pub fn default_site() -> Self {
        Self {
            name: DEFAULT_SITE_NAME.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            marketplace_id: DEFAULT_MARKETPLACE_ID.to_string(),
            categories: default_categories(),
            scrape_all: false,
        }
    }

    /// The whole catalog when `scrape_all` is set, otherwise the configured list
    pub fn categories_to_scrape(&self) -> Vec<String> {
        if self.scrape_all {
            CATEGORY_CATALOG.iter().map(|c| c.to_string()).collect()
        } else {
            self.categories.clone()
        }
    }

    pub fn target(&self, category: &str) -> ScrapeTarget {
        ScrapeTarget {
            site: self.name.clone(),
            base_url: self.base_url.clone(),
            marketplace_id: self.marketplace_id.clone(),
            category: category.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitesConfig {
    pub sites: Vec<SiteConfig>,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            sites: vec![SiteConfig::default_site()],
        }
    }
}

impl SitesConfig {
    /// Load the sites file. A missing file is created with the defaults; an
    /// unreadable or malformed one falls back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let defaults = Self::default();
            std::fs::write(path, serde_json::to_string_pretty(&defaults)?)?;
            tracing::info!("Created default sites config at {}", path.display());
            return Ok(defaults);
        }

        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&contents) {
            Ok(value) => Ok(Self::from_value(&value)),
            Err(e) => {
                tracing::warn!("Invalid sites config {}, falling back to defaults: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    /// Lenient normalisation of a parsed sites document
    pub fn from_value(value: &Value) -> Self {
        let Some(root) = value.as_object() else {
            return Self::default();
        };

        let sites = match root.get("sites").and_then(Value::as_array) {
            Some(sites) if !sites.is_empty() => sites,
            // Legacy single-site layout with top-level keys
            _ => {
                return Self {
                    sites: vec![site_from_object(root, DEFAULT_SITE_NAME)],
                };
            }
        };

        let normalized: Vec<SiteConfig> = sites
            .iter()
            .filter_map(Value::as_object)
            .map(|site| site_from_object(site, FALLBACK_SITE_NAME))
            .filter(|site| {
                let valid = Url::parse(&site.base_url).is_ok();
                if !valid {
                    tracing::warn!("Dropping site '{}' with invalid base_url '{}'", site.name, site.base_url);
                }
                valid
            })
            .collect();

        if normalized.is_empty() {
            return Self::default();
        }

        Self { sites: normalized }
    }
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn site_from_object(object: &Map<String, Value>, fallback_name: &str) -> SiteConfig {
    let categories = match object.get("categories").and_then(Value::as_array) {
        Some(list) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => default_categories(),
    };

    SiteConfig {
        name: string_field(object, "name").unwrap_or_else(|| fallback_name.to_string()),
        base_url: string_field(object, "base_url").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        marketplace_id: string_field(object, "marketplace_id").unwrap_or_else(|| DEFAULT_MARKETPLACE_ID.to_string()),
        categories,
        scrape_all: object.get("scrape_all").and_then(Value::as_bool).unwrap_or(false),
    }
}
