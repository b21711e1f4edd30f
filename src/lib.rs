pub mod aggregator;
pub mod change_detector;
pub mod config;
pub mod cycle;
pub mod database;
pub mod models;
pub mod normalizer;
pub mod plugins;
pub mod scheduler;
pub mod scraper;
pub mod utils;

// Re-export commonly used types
pub use aggregator::RunAggregator;
pub use change_detector::{ChangeDetector, ReconciliationBatch};
pub use config::{AppConfig, SiteConfig, SitesConfig};
pub use cycle::{CycleOrchestrator, CyclePhase, CycleReport, CycleSettings, UnitOutcome};
pub use database::{DealStore, MemoryDealStore, SqliteDealStore};
pub use plugins::{NotificationEvent, NotificationResult, NotifierPlugin};
pub use models::{
    AggregatedListing, CanonicalRecord, ChangeEvent, ChangeKind, IdentityKey, RawListing, ScrapeTarget, WatchedField,
};
pub use scheduler::DealScheduler;
pub use scraper::{ChromeDealScraper, DealScraper};
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
