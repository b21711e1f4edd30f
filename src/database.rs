use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::models::{CanonicalRecord, IdentityKey, ListingFields};
use crate::utils::error::{AppError, Result};

/// Persistent canonical state, one record per identity. Each write is a
/// single statement so a record is never left half-written.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn find(&self, key: &IdentityKey) -> Result<Option<CanonicalRecord>>;
    async fn insert(&self, record: &CanonicalRecord) -> Result<()>;
    /// Full replace of the mutable fields of an existing record
    async fn update(&self, record: &CanonicalRecord) -> Result<()>;
}

const CREATE_DEALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deals (
    marketplace_id TEXT NOT NULL,
    site TEXT NOT NULL,
    asin TEXT NOT NULL,
    title TEXT,
    current_price TEXT,
    original_price TEXT,
    discount TEXT,
    deal_badge TEXT,
    image_url TEXT,
    product_url TEXT,
    brand_id TEXT,
    category TEXT,
    base_url TEXT,
    categories TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (marketplace_id, site, asin)
)
"#;

#[derive(Debug, FromRow)]
struct DealRow {
    marketplace_id: String,
    site: String,
    asin: String,
    title: Option<String>,
    current_price: Option<String>,
    original_price: Option<String>,
    discount: Option<String>,
    deal_badge: Option<String>,
    image_url: Option<String>,
    product_url: Option<String>,
    brand_id: Option<String>,
    category: Option<String>,
    base_url: Option<String>,
    categories: Json<BTreeSet<String>>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl From<DealRow> for CanonicalRecord {
    fn from(row: DealRow) -> Self {
        CanonicalRecord {
            key: IdentityKey::new(row.marketplace_id, row.site, row.asin),
            categories: row.categories.0,
            fields: ListingFields {
                title: row.title,
                current_price: row.current_price,
                original_price: row.original_price,
                discount: row.discount,
                deal_badge: row.deal_badge,
                image_url: row.image_url,
                product_url: row.product_url,
                brand_id: row.brand_id,
                category: row.category,
                base_url: row.base_url,
            },
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        }
    }
}

#[derive(Clone)]
pub struct SqliteDealStore {
    pool: SqlitePool,
}

impl SqliteDealStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout));

        // An in-memory database lives only as long as its connection
        if config.url.contains(":memory:") {
            pool_options = pool_options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;

        tracing::info!("Connected to deal store at {}", config.url);
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_DEALS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deals")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DealStore for SqliteDealStore {
    async fn find(&self, key: &IdentityKey) -> Result<Option<CanonicalRecord>> {
        let row = sqlx::query_as::<_, DealRow>(
            "SELECT * FROM deals WHERE marketplace_id = ? AND site = ? AND asin = ?",
        )
        .bind(&key.marketplace_id)
        .bind(&key.site)
        .bind(&key.item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CanonicalRecord::from))
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<()> {
        let fields = &record.fields;
        sqlx::query(
            r#"
            INSERT INTO deals (
                marketplace_id, site, asin, title, current_price, original_price, discount,
                deal_badge, image_url, product_url, brand_id, category, base_url,
                categories, first_seen, last_seen
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.key.marketplace_id)
        .bind(&record.key.site)
        .bind(&record.key.item_id)
        .bind(&fields.title)
        .bind(&fields.current_price)
        .bind(&fields.original_price)
        .bind(&fields.discount)
        .bind(&fields.deal_badge)
        .bind(&fields.image_url)
        .bind(&fields.product_url)
        .bind(&fields.brand_id)
        .bind(&fields.category)
        .bind(&fields.base_url)
        .bind(Json(&record.categories))
        .bind(record.first_seen)
        .bind(record.last_seen)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, record: &CanonicalRecord) -> Result<()> {
        let fields = &record.fields;
        let result = sqlx::query(
            r#"
            UPDATE deals SET
                title = ?, current_price = ?, original_price = ?, discount = ?,
                deal_badge = ?, image_url = ?, product_url = ?, brand_id = ?,
                category = ?, base_url = ?, categories = ?, last_seen = ?
            WHERE marketplace_id = ? AND site = ? AND asin = ?
            "#,
        )
        .bind(&fields.title)
        .bind(&fields.current_price)
        .bind(&fields.original_price)
        .bind(&fields.discount)
        .bind(&fields.deal_badge)
        .bind(&fields.image_url)
        .bind(&fields.product_url)
        .bind(&fields.brand_id)
        .bind(&fields.category)
        .bind(&fields.base_url)
        .bind(Json(&record.categories))
        .bind(record.last_seen)
        .bind(&record.key.marketplace_id)
        .bind(&record.key.site)
        .bind(&record.key.item_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("deal {}", record.key),
            });
        }
        Ok(())
    }
}

/// Store kept entirely in memory, for tests and throwaway runs
#[derive(Default)]
pub struct MemoryDealStore {
    records: RwLock<HashMap<IdentityKey, CanonicalRecord>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<CanonicalRecord> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn find(&self, key: &IdentityKey) -> Result<Option<CanonicalRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Err(AppError::Validation(format!("deal {} already exists", record.key)));
        }
        records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &CanonicalRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.key) {
            Some(existing) => {
                let first_seen = existing.first_seen;
                *existing = record.clone();
                existing.first_seen = first_seen;
                Ok(())
            }
            None => Err(AppError::NotFound {
                resource: format!("deal {}", record.key),
            }),
        }
    }
}
