use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use deal_watcher::config::AppConfig;
use deal_watcher::plugins::notifiers::{DiscordNotifier, LogNotifier};
use deal_watcher::{
    ChangeDetector, ChromeDealScraper, CycleOrchestrator, CycleSettings, DealScheduler, NotifierPlugin, SitesConfig,
    SqliteDealStore,
};

#[derive(Debug, Parser)]
#[command(name = "deal-watcher", version, about = "Watches marketplace deal pages and announces new and changed deals")]
struct Cli {
    /// Sites file (overrides DEALS_SITES_FILE)
    #[arg(short, long)]
    config: Option<String>,

    /// Run a single sync and exit
    #[arg(long)]
    once: bool,

    /// Log notifications instead of sending them
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("deal_watcher=debug".parse()?);

    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "deal-watcher.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let _log_guard = init_logging(config.as_ref().ok().and_then(|c| c.log_dir.as_deref()))?;

    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    if let Some(path) = cli.config {
        config.sites_file = path;
    }

    info!("Starting Deal Watcher...");

    if let Some(port) = config.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()?;
        info!("Metrics exporter listening on port {}", port);
    }

    let sites = SitesConfig::load(&config.sites_file)?;
    info!("Loaded {} site(s) from {}", sites.sites.len(), config.sites_file);

    let store = Arc::new(SqliteDealStore::connect(&config.database).await?);

    let notifier: Arc<dyn NotifierPlugin> = if cli.dry_run {
        Arc::new(LogNotifier::new())
    } else {
        Arc::new(DiscordNotifier::new(config.discord.clone())?)
    };
    if let Err(e) = notifier.initialize().await {
        error!("{}", e);
        store.close().await;
        return Err(e.into());
    }

    let detector = ChangeDetector::new(store.clone(), Duration::from_secs(config.cycle.store_timeout_secs));
    let orchestrator = Arc::new(CycleOrchestrator::new(
        sites.sites,
        Arc::new(ChromeDealScraper::new(config.scraper.clone())),
        detector,
        notifier.clone(),
        CycleSettings::from(&config.cycle),
    ));

    if cli.once {
        orchestrator.run_cycle("Manual sync").await;
    } else {
        let mut scheduler = DealScheduler::new(Arc::clone(&orchestrator), config.scheduler.clone()).await?;
        scheduler.start().await?;

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        scheduler.shutdown().await?;
    }

    notifier.shutdown().await?;
    store.close().await;
    Ok(())
}
