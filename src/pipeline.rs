//! End-to-end flash-sale run: load the listing, extract and classify offers,
//! enrich them with categories, write everything back.
//!
//! A run is a fixed sequence of stages. Any error that escapes a stage sends
//! the whole run back to the start, a bounded number of times. Errors never
//! leave [`Pipeline::run`]; they are logged.

use chrono::{Datelike, Local};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::Instrument;
use uuid::Uuid;

use crate::classifier::classify;
use crate::config::AppConfig;
use crate::detail_fetcher::{DetailFetcher, DetailOutcome, DetailSettings};
use crate::extractor::ListingExtractor;
use crate::models::{ProductRecord, ProductUpdate};
use crate::scraper::{BrowserSession, Page, PageFetcher};
use crate::store::ProductStore;
use crate::utils::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Population {
    /// Offers seen for the first time in this run.
    New,
    /// Stored offers whose categories are still missing.
    Backlog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    FetchingListing,
    Extracting,
    Classifying,
    FetchingDetails(Population),
    PersistingInserts,
    QueryingUncategorized,
    PersistingUpdates,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::FetchingListing => write!(f, "fetching listing"),
            PipelineStage::Extracting => write!(f, "extracting"),
            PipelineStage::Classifying => write!(f, "classifying"),
            PipelineStage::FetchingDetails(Population::New) => write!(f, "fetching details (new)"),
            PipelineStage::FetchingDetails(Population::Backlog) => write!(f, "fetching details (backlog)"),
            PipelineStage::PersistingInserts => write!(f, "persisting inserts"),
            PipelineStage::QueryingUncategorized => write!(f, "querying uncategorized"),
            PipelineStage::PersistingUpdates => write!(f, "persisting updates"),
            PipelineStage::Done => write!(f, "done"),
            PipelineStage::Failed => write!(f, "failed"),
        }
    }
}

/// Counters for one successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub extracted: usize,
    pub new_records: usize,
    pub known_records: usize,
    pub lookup_failures: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub updated: usize,
    pub backlog: usize,
    pub backlog_categorized: usize,
    pub detail_failures: usize,
    pub write_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineOutcome {
    Completed { attempts: usize, report: PipelineReport },
    Failed { attempts: usize, last_error: String },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone)]
struct ListingSettings {
    url: String,
    link_text: Option<String>,
    timeout: Duration,
}

pub struct Pipeline {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ProductStore>,
    details: DetailFetcher,
    listing: ListingSettings,
    max_attempts: usize,
    retry_delay: Duration,
    listing_year: Option<i32>,
}

impl Pipeline {
    /// Fails on a configuration that `AppConfig::validate` rejects, such as a
    /// zero concurrency ceiling that would leave every detail task waiting.
    pub fn new(config: &AppConfig, fetcher: Arc<dyn PageFetcher>, store: Arc<dyn ProductStore>) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(Semaphore::new(config.details.max_concurrent));
        let details = DetailFetcher::new(
            Arc::clone(&fetcher),
            limiter,
            DetailSettings::from_config(&config.scraper, &config.details)?,
        )?;

        Ok(Self {
            fetcher,
            store,
            details,
            listing: ListingSettings {
                url: config.scraper.listing_url.clone(),
                link_text: config.scraper.listing_link_text.clone(),
                timeout: config.scraper.navigation_timeout(),
            },
            max_attempts: config.pipeline.max_attempts.max(1),
            retry_delay: config.pipeline.retry_delay(),
            listing_year: None,
        })
    }

    /// Pin the year used to complete listing dates instead of the current one.
    pub fn with_listing_year(mut self, year: i32) -> Self {
        self.listing_year = Some(year);
        self
    }

    /// Run the whole pipeline, restarting from scratch after a failed attempt.
    /// Never returns an error: giving up after the last attempt is logged.
    pub async fn run(&self) -> PipelineOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline_run", %run_id);

        async {
            metrics::counter!("pipeline_runs_total").increment(1);
            let attempts = AtomicUsize::new(0);
            let strategy = FixedInterval::new(self.retry_delay).take(self.max_attempts - 1);

            let result = Retry::spawn(strategy, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.attempt(attempt)
            })
            .await;

            let attempts = attempts.load(Ordering::SeqCst);
            match result {
                Ok(report) => {
                    tracing::info!(attempts, ?report, "Pipeline finished");
                    PipelineOutcome::Completed { attempts, report }
                }
                Err(e) => {
                    metrics::counter!("pipeline_failures_total").increment(1);
                    tracing::error!(
                        attempts,
                        stage = %PipelineStage::Failed,
                        error = %e,
                        "Max attempts reached, giving up on this run"
                    );
                    PipelineOutcome::Failed {
                        attempts,
                        last_error: e.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn attempt(&self, attempt: usize) -> Result<PipelineReport> {
        tracing::info!(max_attempts = self.max_attempts, "Starting pipeline attempt");

        let session = self.fetcher.open_session().await.inspect_err(|e| {
            tracing::warn!(stage = %PipelineStage::FetchingListing, error = %e, "Could not open listing session");
        })?;

        let mut stage = PipelineStage::FetchingListing;
        let result = match AssertUnwindSafe(self.drive(session.as_ref(), &mut stage))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(AppError::Internal(format!(
                "pipeline panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        // The listing session is released whatever happened above
        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close listing session");
        }

        if let Err(e) = &result {
            tracing::warn!(stage = %stage, error = %e, "Pipeline attempt failed");
        }
        result
    }

    async fn drive(&self, session: &dyn BrowserSession, stage: &mut PipelineStage) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        *stage = PipelineStage::FetchingListing;
        let page = self.load_listing(session).await?;

        *stage = PipelineStage::Extracting;
        let year = self.listing_year.unwrap_or_else(|| Local::now().year());
        let records = ListingExtractor::new(year)?.extract(&page.html);
        report.extracted = records.len();

        *stage = PipelineStage::Classifying;
        let classification = classify(records, self.store.as_ref()).await;
        report.new_records = classification.to_insert.len();
        report.known_records = classification.to_update.len();
        report.lookup_failures = classification.skipped;

        *stage = PipelineStage::FetchingDetails(Population::New);
        let fetched = self.details.fetch_all(classification.to_insert).await;
        report.detail_failures += fetched.iter().filter(|o| o.is_failure()).count();

        *stage = PipelineStage::PersistingInserts;
        for outcome in fetched {
            self.persist_insert(outcome.into_record(), &mut report).await;
        }

        *stage = PipelineStage::QueryingUncategorized;
        let backlog = self.store.records_missing_categories().await?;
        report.backlog = backlog.len();

        *stage = PipelineStage::FetchingDetails(Population::Backlog);
        let backlog = self.details.fetch_all(backlog).await;
        report.detail_failures += backlog.iter().filter(|o| o.is_failure()).count();

        *stage = PipelineStage::PersistingUpdates;
        for record in &classification.to_update {
            let update = ProductUpdate::from_listing(record);
            if self.persist_update(record, &update, &mut report).await {
                report.updated += 1;
            }
        }
        for outcome in backlog {
            if let DetailOutcome::Fetched(record) = outcome {
                let update = ProductUpdate::from_categories(&record);
                if self.persist_update(&record, &update, &mut report).await {
                    report.backlog_categorized += 1;
                }
            }
        }

        *stage = PipelineStage::Done;
        Ok(report)
    }

    async fn load_listing(&self, session: &dyn BrowserSession) -> Result<Page> {
        let page = session.navigate(&self.listing.url, self.listing.timeout).await?;

        match &self.listing.link_text {
            Some(link_text) => {
                tracing::debug!(link_text = %link_text, "Following link to full listing");
                session.follow_link(link_text, self.listing.timeout).await
            }
            None => Ok(page),
        }
    }

    async fn persist_insert(&self, record: ProductRecord, report: &mut PipelineReport) {
        match self.store.insert(&record).await {
            Ok(true) => {
                metrics::counter!("records_inserted_total").increment(1);
                tracing::info!(item_id = record.external_id(), fingerprint = %record.fingerprint(), "Inserted product");
                report.inserted += 1;
            }
            Ok(false) => {
                tracing::debug!(fingerprint = %record.fingerprint(), "Product already stored, insert skipped");
                report.duplicates += 1;
            }
            Err(e) => {
                tracing::warn!(item_id = record.external_id(), error = %e, "Failed to insert product");
                report.write_failures += 1;
            }
        }
    }

    /// Returns whether a stored row was changed.
    async fn persist_update(&self, record: &ProductRecord, update: &ProductUpdate, report: &mut PipelineReport) -> bool {
        match self.store.update_by_fingerprint(record.fingerprint(), update).await {
            Ok(true) => {
                tracing::debug!(item_id = record.external_id(), "Updated product");
                true
            }
            Ok(false) => {
                tracing::warn!(fingerprint = %record.fingerprint(), "No stored product to update");
                false
            }
            Err(e) => {
                tracing::warn!(item_id = record.external_id(), error = %e, "Failed to update product");
                report.write_failures += 1;
                false
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
