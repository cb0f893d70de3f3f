use chrono::{Datelike, Local};
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;

use crate::models::{ProductRecord, PurchaseWindow};
use crate::utils::error::{AppError, Result};

// Listing topology: sale-window sections, each holding product entries.
const SECTION_SELECTOR: &str = "div.MENTAL";
const ENTRY_SELECTOR: &str = "ul.product_Area li.box1";
const WINDOW_SELECTOR: &str = "div.dateTime div.period span";
const LINK_SELECTOR: &str = r#"a[id^="gdsHref_1"]"#;
const IMAGE_SELECTOR: &str = "img#nowPImg_1";
const BRAND_SELECTOR: &str = "div.brand";
const NAME_SELECTOR: &str = "div.brand2";
const COUNTDOWN_SELECTOR: &str = "div.last #gdsStock_1";
const PRICE_SELECTOR: &str = "div.price";

// Detail page topology
const CATEGORY_SELECTOR: &str = "div#bt_996_layout div.navcontent_list ul#toothUl li.FBGO";

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| AppError::parse(format!("invalid selector '{}': {:?}", css, e)))
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| AppError::parse(format!("invalid pattern '{}': {}", re, e)))
}

/// Turns a rendered sale listing into product records.
pub struct ListingExtractor {
    section: Selector,
    entry: Selector,
    window: Selector,
    link: Selector,
    image: Selector,
    brand: Selector,
    name: Selector,
    countdown: Selector,
    price: Selector,
    item_id: Regex,
    price_number: Regex,
    count_number: Regex,
    year: i32,
}

impl ListingExtractor {
    /// `year` completes the year-less purchase windows shown on the listing.
    pub fn new(year: i32) -> Result<Self> {
        Ok(Self {
            section: selector(SECTION_SELECTOR)?,
            entry: selector(ENTRY_SELECTOR)?,
            window: selector(WINDOW_SELECTOR)?,
            link: selector(LINK_SELECTOR)?,
            image: selector(IMAGE_SELECTOR)?,
            brand: selector(BRAND_SELECTOR)?,
            name: selector(NAME_SELECTOR)?,
            countdown: selector(COUNTDOWN_SELECTOR)?,
            price: selector(PRICE_SELECTOR)?,
            item_id: pattern(r"i_code=(\d+)")?,
            price_number: pattern(r"\d+(?:\.\d+)?")?,
            count_number: pattern(r"\d+(?:,\d{3})*")?,
            year,
        })
    }

    pub fn for_current_year() -> Result<Self> {
        Self::new(Local::now().year())
    }

    /// Extract every well-formed entry. Entries without an item id or whose
    /// section has an unreadable purchase window are dropped and logged.
    pub fn extract(&self, html: &str) -> Vec<ProductRecord> {
        let document = Html::parse_document(html);
        let mut records = Vec::new();

        for (section_index, section) in document.select(&self.section).enumerate() {
            let window_text = first_text(section, &self.window);
            let window = match window_text.as_deref() {
                Some(text) => PurchaseWindow::parse(text, self.year),
                None => Err(AppError::parse("purchase window not found")),
            };

            for entry in section.select(&self.entry) {
                let item_id = self.item_id(entry);
                let brand = first_text(entry, &self.brand);
                let product_name = first_text(entry, &self.name);

                let Some(item_id) = item_id else {
                    tracing::warn!(
                        section = section_index,
                        brand = brand.as_deref(),
                        product = product_name.as_deref(),
                        "Dropping listing entry: missing item id"
                    );
                    continue;
                };

                let window = match &window {
                    Ok(window) => *window,
                    Err(e) => {
                        tracing::warn!(
                            section = section_index,
                            item_id = %item_id,
                            window = window_text.as_deref(),
                            error = %e,
                            "Dropping listing entry: unparseable purchase window"
                        );
                        continue;
                    }
                };

                let mut record = ProductRecord::new(item_id, window, brand, product_name);
                record.image_url = entry
                    .select(&self.image)
                    .next()
                    .and_then(|img| img.value().attr("src"))
                    .map(|src| src.trim().to_string())
                    .filter(|src| !src.is_empty());
                record.price = first_text(entry, &self.price).and_then(|t| self.parse_price(&t));
                record.countdown = first_text(entry, &self.countdown).and_then(|t| self.parse_count(&t));

                records.push(record);
            }
        }

        tracing::debug!(records = records.len(), "Extracted listing entries");
        records
    }

    fn item_id(&self, entry: ElementRef<'_>) -> Option<String> {
        let href = entry.select(&self.link).next()?.value().attr("href")?;
        let captures = self.item_id.captures(href)?;
        Some(captures.get(1)?.as_str().to_string())
    }

    /// `"$1,299"` → `1299`. Every `$` and `,` is dropped before the number is read.
    pub fn parse_price(&self, text: &str) -> Option<Decimal> {
        let cleaned = text.replace(['$', ','], "");
        let number = self.price_number.find(&cleaned)?.as_str();
        Decimal::from_str(number).ok()
    }

    /// `"1,024"` → `1024`.
    pub fn parse_count(&self, text: &str) -> Option<i64> {
        let number = self.count_number.find(text)?.as_str().replace(',', "");
        number.parse().ok()
    }
}

/// Reads the category breadcrumb of a product detail page.
pub struct CategoryExtractor {
    category: Selector,
}

impl CategoryExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            category: selector(CATEGORY_SELECTOR)?,
        })
    }

    /// Categories in page order. A page without the category block yields an
    /// empty list.
    pub fn extract(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let mut categories: Vec<String> = Vec::new();

        for item in document.select(&self.category) {
            let text = normalized_text(item);
            if !text.is_empty() && !categories.contains(&text) {
                categories.push(text);
            }
        }

        categories
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .map(normalized_text)
        .filter(|text| !text.is_empty())
}

fn normalized_text(element: ElementRef<'_>) -> String {
    let text: String = element.text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
