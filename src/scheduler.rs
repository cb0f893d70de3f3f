use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::utils::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
    /// Ticks dropped because the previous run was still going.
    pub skipped_ticks: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<PipelineOutcome>,
}

/// Runs the pipeline on a cron schedule, at most one run at a time.
pub struct WatchScheduler {
    scheduler: JobScheduler,
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    running: Arc<Mutex<()>>,
    job_id: Option<Uuid>,
}

impl WatchScheduler {
    pub async fn new(pipeline: Arc<Pipeline>, config: SchedulerConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;

        Ok(Self {
            scheduler,
            pipeline,
            config,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            running: Arc::new(Mutex::new(())),
            job_id: None,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);

        let job = Job::new_async(self.config.cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let stats = Arc::clone(&stats);
            let running = Arc::clone(&running);

            Box::pin(async move {
                run_tick(&pipeline, &running, &stats).await;
            })
        })
        .map_err(scheduler_error)?;

        let job_id = self.scheduler.add(job).await.map_err(scheduler_error)?;
        self.job_id = Some(job_id);
        self.scheduler.start().await.map_err(scheduler_error)?;

        tracing::info!(cron = %self.config.cron, %job_id, "Watch scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await.map_err(scheduler_error)?;
        tracing::info!("Watch scheduler shutdown");
        Ok(())
    }

    /// Run the pipeline right away, subject to the same overlap rule as ticks.
    pub async fn run_now(&self) -> Option<PipelineOutcome> {
        run_tick(&self.pipeline, &self.running, &self.stats).await
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }
}

/// Returns `None` when the tick was skipped.
async fn run_tick(
    pipeline: &Pipeline,
    running: &Mutex<()>,
    stats: &RwLock<SchedulerStats>,
) -> Option<PipelineOutcome> {
    let Ok(_guard) = running.try_lock() else {
        tracing::warn!("Previous run still in progress, skipping this tick");
        let mut stats = stats.write().await;
        stats.ticks += 1;
        stats.skipped_ticks += 1;
        return None;
    };

    let started = Utc::now();
    let outcome = pipeline.run().await;

    let mut stats = stats.write().await;
    stats.ticks += 1;
    if outcome.is_completed() {
        stats.completed_runs += 1;
    } else {
        stats.failed_runs += 1;
    }
    stats.last_run = Some(started);
    stats.last_outcome = Some(outcome.clone());

    Some(outcome)
}

fn scheduler_error(e: tokio_cron_scheduler::JobSchedulerError) -> AppError {
    AppError::Internal(format!("scheduler error: {e}"))
}
