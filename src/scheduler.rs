use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::{SchedulerConfig, is_valid_cron};
use crate::cycle::CycleOrchestrator;
use crate::utils::error::{AppError, Result};

pub const SCHEDULED_REASON: &str = "Scheduled hourly sync";
pub const STARTUP_REASON: &str = "Initial sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub schedule: String,
    pub completed_cycles: u64,
    pub skipped_cycles: u64,
    pub next_run: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

/// Fires the recurring sync and the one-off startup sync. Both go through
/// the same orchestrator entry point.
pub struct DealScheduler {
    scheduler: JobScheduler,
    orchestrator: Arc<CycleOrchestrator>,
    config: SchedulerConfig,
    job_id: Option<Uuid>,
    initial_sync: Option<JoinHandle<()>>,
    start_time: DateTime<Utc>,
}

impl DealScheduler {
    pub async fn new(orchestrator: Arc<CycleOrchestrator>, config: SchedulerConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            orchestrator,
            config,
            job_id: None,
            initial_sync: None,
            start_time: Utc::now(),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        if !Self::validate_cron_expression(&self.config.schedule) {
            return Err(AppError::InvalidConfig(format!(
                "Invalid cron expression: {}",
                self.config.schedule
            )));
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let job = Job::new_async(self.config.schedule.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.run_cycle(SCHEDULED_REASON).await;
            })
        })?;

        let job_id = self.scheduler.add(job).await?;
        self.job_id = Some(job_id);
        self.scheduler.start().await?;
        tracing::info!("Deal scheduler started with schedule: {}", self.config.schedule);

        if self.config.run_on_startup {
            self.spawn_initial_sync();
        }

        Ok(())
    }

    /// Run one sync in the background right away
    pub fn spawn_initial_sync(&mut self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        self.initial_sync = Some(tokio::spawn(async move {
            orchestrator.run_cycle(STARTUP_REASON).await;
        }));
    }

    /// Wait for the startup sync, if one was spawned
    pub async fn wait_for_initial_sync(&mut self) {
        if let Some(handle) = self.initial_sync.take() {
            if let Err(e) = handle.await {
                tracing::error!("Initial sync task failed: {}", e);
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(handle) = self.initial_sync.take() {
            handle.abort();
            tracing::debug!("Cancelled initial sync");
        }

        self.scheduler.shutdown().await?;
        tracing::info!("Deal scheduler shutdown");
        Ok(())
    }

    pub async fn get_stats(&mut self) -> SchedulerStats {
        let next_run = match self.job_id {
            Some(id) => self.scheduler.next_tick_for_job(id).await.ok().flatten(),
            None => None,
        };

        SchedulerStats {
            schedule: self.config.schedule.clone(),
            completed_cycles: self.orchestrator.completed_cycles(),
            skipped_cycles: self.orchestrator.skipped_cycles(),
            next_run,
            uptime_seconds: (Utc::now() - self.start_time).num_seconds().max(0) as u64,
        }
    }

    /// Validate a cron expression (six fields, seconds first)
    pub fn validate_cron_expression(expression: &str) -> bool {
        is_valid_cron(expression)
    }
}
