use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ScraperConfig;
use crate::utils::error::{AppError, Result};

/// A loaded page: the URL after redirects and the rendered document.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub html: String,
}

/// One isolated browsing session. State in one session never leaks into
/// another, so sessions can run side by side.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Page>;

    /// Click the link whose visible text is `link_text` and return the page it
    /// leads to.
    async fn follow_link(&self, link_text: &str, timeout: Duration) -> Result<Page>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Launches a dedicated headless Chrome process per session.
pub struct ChromeFetcher {
    config: ScraperConfig,
}

pub struct ChromeSession {
    // Keeps the Chrome process alive for as long as the session exists
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeFetcher {
    pub fn new(config: ScraperConfig) -> Self {
        Self { config }
    }

    fn launch_options(&self) -> Result<LaunchOptions<'static>> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(self.config.headless)
            .sandbox(false) // Often needed in containerized environments
            .idle_browser_timeout(self.config.navigation_timeout() * 2)
            .args(vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-background-timer-throttling"),
                OsStr::new("--disable-backgrounding-occluded-windows"),
                OsStr::new("--disable-renderer-backgrounding"),
            ])
            .build()
            .map_err(|e| AppError::Browser(format!("Failed to create launch options: {}", e)))?;

        if let Some(chrome_path) = &self.config.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(chrome_path));
        }

        Ok(launch_options)
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let launch_options = self.launch_options()?;
        let user_agent = self.config.user_agent.clone();

        // headless_chrome drives Chrome over a blocking websocket
        let session = tokio::task::spawn_blocking(move || -> Result<ChromeSession> {
            let browser = Browser::new(launch_options)
                .map_err(|e| AppError::Browser(format!("Failed to launch browser: {}", e)))?;

            let tab = browser
                .new_tab()
                .map_err(|e| AppError::Browser(format!("Failed to create tab: {}", e)))?;

            tab.set_user_agent(&user_agent, None, None)
                .map_err(|e| AppError::Browser(format!("Failed to set user agent: {}", e)))?;

            Ok(ChromeSession {
                _browser: browser,
                tab,
            })
        })
        .await??;

        tracing::debug!("Opened browser session");
        Ok(Box::new(session))
    }
}

impl ChromeSession {
    async fn with_tab<T, F>(&self, url: &str, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let task = tokio::task::spawn_blocking(move || {
            tab.set_default_timeout(timeout);
            work(&tab)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(AppError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn loaded_page(tab: &Tab, requested_url: &str) -> Result<Page> {
    let html = tab
        .get_content()
        .map_err(|e| AppError::navigation(requested_url, format!("Failed to get page content: {}", e)))?;

    // Get final URL after redirects
    let url = {
        let url = tab.get_url();
        if url.is_empty() {
            requested_url.to_string()
        } else {
            url
        }
    };

    Ok(Page { url, html })
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Page> {
        let target = url.to_string();
        self.with_tab(url, timeout, move |tab| {
            tab.navigate_to(&target)
                .map_err(|e| AppError::navigation(&target, e))?;
            tab.wait_until_navigated()
                .map_err(|e| AppError::navigation(&target, format!("Page load failed: {}", e)))?;
            loaded_page(tab, &target)
        })
        .await
    }

    async fn follow_link(&self, link_text: &str, timeout: Duration) -> Result<Page> {
        let current_url = self.tab.get_url();
        let xpath = link_xpath(link_text);
        let from = current_url.clone();

        self.with_tab(&current_url, timeout, move |tab| {
            let link = tab
                .find_element_by_xpath(&xpath)
                .map_err(|e| AppError::navigation(&from, format!("Link {} not found: {}", xpath, e)))?;
            link.click()
                .map_err(|e| AppError::navigation(&from, format!("Click failed: {}", e)))?;
            tab.wait_until_navigated()
                .map_err(|e| AppError::navigation(&from, format!("Page load failed: {}", e)))?;
            loaded_page(tab, &from)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || tab.close(true))
            .await?
            .map_err(|e| AppError::Browser(format!("Failed to close tab: {}", e)))?;
        Ok(())
    }
}

/// XPath matching an anchor by its whitespace-normalized text.
fn link_xpath(link_text: &str) -> String {
    format!("//a[normalize-space(.)={}]", xpath_literal(link_text.trim()))
}

fn xpath_literal(text: &str) -> String {
    if !text.contains('"') {
        return format!("\"{}\"", text);
    }
    if !text.contains('\'') {
        return format!("'{}'", text);
    }

    // Both quote kinds: stitch the pieces together with concat()
    let parts: Vec<String> = text.split('"').map(|p| format!("\"{}\"", p)).collect();
    format!("concat({})", parts.join(", '\"', "))
}
