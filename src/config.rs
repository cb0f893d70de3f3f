use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scraper: ScraperConfig,
    pub details: DetailConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub listing_url: String,
    /// Text of the link on the listing page that leads to the full sale list.
    pub listing_link_text: Option<String>,
    /// Detail page; the item id is appended as the `i_code` query parameter.
    pub detail_url: String,
    pub user_agent: String,
    pub chrome_path: Option<String>,
    pub headless: bool,
    pub navigation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    pub max_concurrent: usize,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_attempts: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/flash_sales.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            listing_url: "https://www.momoshop.com.tw/main/Main.jsp".to_string(),
            listing_link_text: Some("看全部 >".to_string()),
            detail_url: "https://www.momoshop.com.tw/goods/GoodsDetail.jsp".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
            chrome_path: None,
            headless: true,
            navigation_timeout_ms: 60_000,
        }
    }
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            jitter_min_ms: 1_000,
            jitter_max_ms: 3_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        // sec min hour day month weekday: every hour at minute 55
        Self {
            cron: "0 55 * * * *".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "flash-sale-watcher.log".to_string(),
        }
    }
}

impl ScraperConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

impl PipelineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development
        let _ = dotenvy::dotenv();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Self::load(
            Config::builder()
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
                // Local config (ignored by git)
                .add_source(File::with_name("config/local").required(false)),
        )
    }

    /// Load from a single file plus environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Config::builder().add_source(File::with_name(path)))
    }

    fn load(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let s = builder
            // Environment variables with prefix "WATCHER_", e.g. WATCHER_DETAILS__MAX_CONCURRENT
            .add_source(
                Environment::with_prefix("WATCHER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        if config.scraper.chrome_path.is_none() {
            config.scraper.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("Database url must not be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        if Url::parse(&self.scraper.listing_url).is_err() {
            return Err(ConfigError::Message("Invalid scraper.listing_url".into()));
        }

        if Url::parse(&self.scraper.detail_url).is_err() {
            return Err(ConfigError::Message("Invalid scraper.detail_url".into()));
        }

        if self.scraper.navigation_timeout_ms == 0 {
            return Err(ConfigError::Message("Scraper navigation_timeout_ms must be greater than 0".into()));
        }

        if self.details.max_concurrent == 0 {
            return Err(ConfigError::Message("Details max_concurrent must be greater than 0".into()));
        }

        if self.details.jitter_min_ms > self.details.jitter_max_ms {
            return Err(ConfigError::Message("Details jitter_min_ms cannot exceed jitter_max_ms".into()));
        }

        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::Message("Pipeline max_attempts must be greater than 0".into()));
        }

        if !is_valid_cron(&self.scheduler.cron) {
            return Err(ConfigError::Message("Invalid cron expression in scheduler.cron".into()));
        }

        Ok(())
    }
}

// tokio-cron-scheduler expressions carry a leading seconds field and an
// optional trailing year field.
fn is_valid_cron(cron_expr: &str) -> bool {
    let parts: Vec<&str> = cron_expr.split_whitespace().collect();
    if parts.len() != 6 && parts.len() != 7 {
        return false;
    }

    // Allow numbers, ranges, lists, steps and wildcards
    parts.iter().all(|part| {
        part.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '-' | ',' | '/' | '?'))
    })
}
