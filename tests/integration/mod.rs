// Shared fixtures: a scripted browser serving listing and detail pages, and
// a pipeline wired to an in-memory store.

pub mod pipeline_tests;

use async_trait::async_trait;
use flash_sale_watcher::config::AppConfig;
use flash_sale_watcher::scraper::{BrowserSession, Page, PageFetcher};
use flash_sale_watcher::{AppError, Pipeline, Result, SqliteProductStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LISTING_URL: &str = "https://shop.test/main/Main.jsp";
pub const DETAIL_URL: &str = "https://shop.test/goods/GoodsDetail.jsp";
pub const LINK_TEXT: &str = "看全部 >";
pub const YEAR: i32 = 2024;

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scraper.listing_url = LISTING_URL.to_string();
    config.scraper.detail_url = DETAIL_URL.to_string();
    config.scraper.listing_link_text = Some(LINK_TEXT.to_string());
    config.scraper.navigation_timeout_ms = 5_000;
    config.details.max_concurrent = 2;
    config.details.jitter_min_ms = 0;
    config.details.jitter_max_ms = 0;
    config.pipeline.max_attempts = 3;
    config.pipeline.retry_delay_ms = 10;
    config
}

/// One listing entry as rendered on the sale page.
#[derive(Debug, Clone)]
pub struct Offer {
    pub id: &'static str,
    pub brand: &'static str,
    pub name: &'static str,
    pub price: &'static str,
    pub stock: &'static str,
}

impl Offer {
    pub fn new(id: &'static str, brand: &'static str, name: &'static str) -> Self {
        Self {
            id,
            brand,
            name,
            price: "$1,000",
            stock: "50",
        }
    }

    pub fn priced(mut self, price: &'static str, stock: &'static str) -> Self {
        self.price = price;
        self.stock = stock;
        self
    }

    fn render(&self) -> String {
        format!(
            r#"<li class="box1"><a id="gdsHref_1_{id}" href="/goods/GoodsDetail.jsp?i_code={id}">
                <img id="nowPImg_1" src="https://img.shop.test/{id}.jpg">
                <div class="brand">{brand}</div>
                <div class="brand2">{name}</div>
                <div class="last">剩餘 <span id="gdsStock_1">{stock}</span> 組</div>
                <div class="price">{price}</div>
            </a></li>"#,
            id = self.id,
            brand = self.brand,
            name = self.name,
            stock = self.stock,
            price = self.price,
        )
    }
}

pub fn listing(sections: &[(&str, Vec<Offer>)]) -> String {
    let sections: Vec<String> = sections
        .iter()
        .map(|(window, offers)| {
            let entries: Vec<String> = offers.iter().map(Offer::render).collect();
            format!(
                r#"<div class="MENTAL">
                    <div class="dateTime"><div class="period"><span>{window}</span></div></div>
                    <ul class="product_Area">{}</ul>
                </div>"#,
                entries.join("\n")
            )
        })
        .collect();
    format!("<html><body>{}</body></html>", sections.join("\n"))
}

pub fn detail_page(categories: &[&str]) -> String {
    let items: Vec<String> = categories
        .iter()
        .map(|c| format!(r#"<li class="FBGO">{c}</li>"#))
        .collect();
    format!(
        r#"<html><body><div id="bt_996_layout"><div class="navcontent_list">
            <ul id="toothUl">{}</ul>
        </div></div></body></html>"#,
        items.join("")
    )
}

#[derive(Debug, Clone)]
pub enum DetailScript {
    Categories(Vec<&'static str>),
    Broken,
}

#[derive(Default)]
struct BrowserState {
    listing_html: Mutex<String>,
    details: Mutex<HashMap<String, DetailScript>>,
    open_failures: AtomicUsize,
    listing_failures: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    detail_visits: Mutex<Vec<String>>,
}

/// Plays back scripted pages; every session shares the same script.
#[derive(Clone, Default)]
pub struct ScriptedBrowser {
    state: Arc<BrowserState>,
}

impl ScriptedBrowser {
    pub fn set_listing(&self, html: String) {
        *self.state.listing_html.lock().unwrap() = html;
    }

    pub fn set_detail(&self, id: &str, script: DetailScript) {
        self.state.details.lock().unwrap().insert(id.to_string(), script);
    }

    /// The next `n` session launches fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.state.open_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` attempts to reach the full listing fail.
    pub fn fail_next_listings(&self, n: usize) {
        self.state.listing_failures.store(n, Ordering::SeqCst);
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn detail_visits(&self) -> Vec<String> {
        self.state.detail_visits.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PageFetcher for ScriptedBrowser {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        if take_one(&self.state.open_failures) {
            return Err(AppError::Browser("failed to launch browser".to_string()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedSession {
    state: Arc<BrowserState>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<Page> {
        if url == LISTING_URL {
            return Ok(Page {
                url: url.to_string(),
                html: "<html><body><a href=\"/sale\">看全部 &gt;</a></body></html>".to_string(),
            });
        }

        let id = url
            .split("i_code=")
            .nth(1)
            .ok_or_else(|| AppError::navigation(url, "unexpected url"))?
            .to_string();
        self.state.detail_visits.lock().unwrap().push(id.clone());

        let script = self.state.details.lock().unwrap().get(&id).cloned();
        match script {
            Some(DetailScript::Categories(categories)) => Ok(Page {
                url: url.to_string(),
                html: detail_page(&categories),
            }),
            Some(DetailScript::Broken) | None => Err(AppError::navigation(url, "net::ERR_CONNECTION_RESET")),
        }
    }

    async fn follow_link(&self, link_text: &str, _timeout: Duration) -> Result<Page> {
        if link_text != LINK_TEXT {
            return Err(AppError::Browser(format!("no link with text {link_text}")));
        }
        if take_one(&self.state.listing_failures) {
            return Err(AppError::navigation(LISTING_URL, "net::ERR_TIMED_OUT"));
        }
        Ok(Page {
            url: format!("{LISTING_URL}#sale"),
            html: self.state.listing_html.lock().unwrap().clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub browser: ScriptedBrowser,
    pub store: SqliteProductStore,
    pub pipeline: Pipeline,
}

pub async fn harness() -> anyhow::Result<Harness> {
    harness_with(test_config()).await
}

pub async fn harness_with(config: AppConfig) -> anyhow::Result<Harness> {
    let browser = ScriptedBrowser::default();
    let store = SqliteProductStore::in_memory().await?;
    let pipeline = Pipeline::new(&config, Arc::new(browser.clone()), Arc::new(store.clone()))?
        .with_listing_year(YEAR);

    Ok(Harness {
        browser,
        store,
        pipeline,
    })
}

pub async fn row_count(store: &SqliteProductStore) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(store.pool())
        .await?;
    Ok(count)
}
