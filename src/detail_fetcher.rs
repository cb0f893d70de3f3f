use futures::future::join_all;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::{DetailConfig, ScraperConfig};
use crate::extractor::CategoryExtractor;
use crate::models::ProductRecord;
use crate::scraper::PageFetcher;
use crate::utils::error::{AppError, Result};

/// Result of one detail visit. The record comes back either way; a failed
/// visit leaves it with empty categories so a later run picks it up again.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    Fetched(ProductRecord),
    Failed { record: ProductRecord, reason: String },
}

impl DetailOutcome {
    pub fn record(&self) -> &ProductRecord {
        match self {
            DetailOutcome::Fetched(record) => record,
            DetailOutcome::Failed { record, .. } => record,
        }
    }

    pub fn into_record(self) -> ProductRecord {
        match self {
            DetailOutcome::Fetched(record) => record,
            DetailOutcome::Failed { record, .. } => record,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DetailOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DetailSettings {
    /// Detail page base; the item id goes into the `i_code` query parameter.
    pub detail_url: Url,
    pub navigation_timeout: Duration,
    pub jitter_ms: RangeInclusive<u64>,
}

impl DetailSettings {
    pub fn from_config(scraper: &ScraperConfig, details: &DetailConfig) -> Result<Self> {
        Ok(Self {
            detail_url: Url::parse(&scraper.detail_url)?,
            navigation_timeout: scraper.navigation_timeout(),
            jitter_ms: details.jitter_min_ms..=details.jitter_max_ms,
        })
    }

    pub fn detail_url_for(&self, item_id: &str) -> String {
        let mut url = self.detail_url.clone();
        url.query_pairs_mut().append_pair("i_code", item_id);
        url.into()
    }
}

/// Visits detail pages for many records at once, never holding more sessions
/// than the limiter has permits. The limiter is shared by every batch of a run.
pub struct DetailFetcher {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<Semaphore>,
    extractor: Arc<CategoryExtractor>,
    settings: Arc<DetailSettings>,
}

impl DetailFetcher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, limiter: Arc<Semaphore>, settings: DetailSettings) -> Result<Self> {
        Ok(Self {
            fetcher,
            limiter,
            extractor: Arc::new(CategoryExtractor::new()?),
            settings: Arc::new(settings),
        })
    }

    /// Fetch categories for every record and wait for all of them. Outcomes
    /// come back in input order.
    pub async fn fetch_all(&self, records: Vec<ProductRecord>) -> Vec<DetailOutcome> {
        if records.is_empty() {
            return Vec::new();
        }

        tracing::info!(
            records = records.len(),
            permits = self.limiter.available_permits(),
            "Fetching detail pages"
        );

        let mut fallbacks = Vec::with_capacity(records.len());
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            fallbacks.push(record.clone());
            let task = DetailTask {
                fetcher: Arc::clone(&self.fetcher),
                limiter: Arc::clone(&self.limiter),
                extractor: Arc::clone(&self.extractor),
                settings: Arc::clone(&self.settings),
            };
            handles.push(tokio::spawn(task.run(record)));
        }

        let joined = join_all(handles).await;

        let outcomes: Vec<DetailOutcome> = joined
            .into_iter()
            .zip(fallbacks)
            .map(|(joined, mut fallback)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(item_id = fallback.external_id(), error = %e, "Detail task aborted");
                    fallback.mark_categories_failed();
                    DetailOutcome::Failed {
                        record: fallback,
                        reason: format!("task aborted: {}", e),
                    }
                }
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        metrics::counter!("detail_fetch_failures_total").increment(failed as u64);
        tracing::info!(
            fetched = outcomes.len() - failed,
            failed,
            "Detail batch finished"
        );

        outcomes
    }
}

struct DetailTask {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<Semaphore>,
    extractor: Arc<CategoryExtractor>,
    settings: Arc<DetailSettings>,
}

impl DetailTask {
    async fn run(self, mut record: ProductRecord) -> DetailOutcome {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                record.mark_categories_failed();
                return DetailOutcome::Failed {
                    record,
                    reason: format!("concurrency limiter closed: {}", e),
                };
            }
        };

        let jitter = fastrand::u64(self.settings.jitter_ms.clone());
        if jitter > 0 {
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let url = self.settings.detail_url_for(record.external_id());
        match self.fetch_categories(&url).await {
            Ok(categories) => {
                tracing::debug!(item_id = record.external_id(), categories = ?categories, "Fetched categories");
                record.apply_categories(categories);
                DetailOutcome::Fetched(record)
            }
            Err(e) => {
                tracing::warn!(item_id = record.external_id(), url = %url, error = %e, "Failed to fetch details");
                record.mark_categories_failed();
                DetailOutcome::Failed {
                    record,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn fetch_categories(&self, url: &str) -> Result<Vec<String>> {
        let timeout = self.settings.navigation_timeout;
        let session = self.fetcher.open_session().await?;

        let page = match tokio::time::timeout(timeout, session.navigate(url, timeout)).await {
            Ok(page) => page,
            Err(_) => Err(AppError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = session.close().await {
            tracing::debug!(url, error = %e, "Failed to close detail session");
        }

        let page = page?;
        Ok(self.extractor.extract(&page.html))
    }
}
