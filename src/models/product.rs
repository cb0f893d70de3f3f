use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::error::{AppError, Result};

/// Display value for listing fields the page did not provide.
pub const NOT_FOUND: &str = "not found";

/// Category assigned when a detail page was fetched but listed no categories.
pub const OTHER_CATEGORY: &str = "其他";

const FINGERPRINT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const WINDOW_TIME_FORMAT: &str = "%Y/%m/%d %H:%M";

/// The time range during which a flash-sale offer can be bought.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl PurchaseWindow {
    /// Parse a `"MM/DD HH:MM ~ MM/DD HH:MM"` range. The listing omits the
    /// year, so both ends are placed in `year`.
    pub fn parse(text: &str, year: i32) -> Result<Self> {
        let (start, end) = text
            .split_once('~')
            .ok_or_else(|| AppError::parse(format!("purchase window without '~': {:?}", text)))?;

        Ok(Self {
            start: parse_window_time(start, year)?,
            end: parse_window_time(end, year)?,
        })
    }
}

fn parse_window_time(part: &str, year: i32) -> Result<NaiveDateTime> {
    let with_year = format!("{}/{}", year, part.trim());
    NaiveDateTime::parse_from_str(&with_year, WINDOW_TIME_FORMAT)
        .map_err(|e| AppError::parse(format!("invalid purchase time {:?}: {}", part.trim(), e)))
}

/// Logical identity of a sale offer: `start|end|brand|product_name`.
///
/// The site reuses item ids across unrelated sale cycles, so the id is not
/// part of the identity. Price and countdown are left out: a price
/// change on the same offer is an update, never a new offer. Missing brand or
/// name contribute an empty segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compose(window: &PurchaseWindow, brand: Option<&str>, product_name: Option<&str>) -> Self {
        Self(format!(
            "{}|{}|{}|{}",
            window.start.format(FINGERPRINT_TIME_FORMAT),
            window.end.format(FINGERPRINT_TIME_FORMAT),
            brand.unwrap_or_default(),
            product_name.unwrap_or_default(),
        ))
    }

    /// Wrap a fingerprint read back from storage.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecord {
    external_id: String,
    fingerprint: Fingerprint,
    brand: Option<String>,
    product_name: Option<String>,
    window: PurchaseWindow,

    pub image_url: Option<String>,
    pub price: Option<Decimal>,
    pub countdown: Option<i64>,

    // None: never fetched. Some([]): fetch failed, retry on a later run.
    // Some(["其他"]): fetched, the page listed nothing.
    pub categories: Option<Vec<String>>,
}

impl ProductRecord {
    pub fn new(
        external_id: impl Into<String>,
        window: PurchaseWindow,
        brand: Option<String>,
        product_name: Option<String>,
    ) -> Self {
        let fingerprint = Fingerprint::compose(&window, brand.as_deref(), product_name.as_deref());
        Self {
            external_id: external_id.into(),
            fingerprint,
            brand,
            product_name,
            window,
            image_url: None,
            price: None,
            countdown: None,
            categories: None,
        }
    }

    /// Rebuild a record from a stored row, keeping the stored fingerprint.
    pub fn restore(
        external_id: String,
        fingerprint: Fingerprint,
        window: PurchaseWindow,
        brand: Option<String>,
        product_name: Option<String>,
    ) -> Self {
        Self {
            external_id,
            fingerprint,
            brand,
            product_name,
            window,
            image_url: None,
            price: None,
            countdown: None,
            categories: None,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn brand(&self) -> Option<&str> {
        self.brand.as_deref()
    }

    pub fn product_name(&self) -> Option<&str> {
        self.product_name.as_deref()
    }

    pub fn window(&self) -> &PurchaseWindow {
        &self.window
    }

    pub fn display_brand(&self) -> &str {
        self.brand().unwrap_or(NOT_FOUND)
    }

    pub fn display_product_name(&self) -> &str {
        self.product_name().unwrap_or(NOT_FOUND)
    }

    pub fn display_image_url(&self) -> &str {
        self.image_url.as_deref().unwrap_or(NOT_FOUND)
    }

    pub fn display_price(&self) -> String {
        self.price
            .map(|p| p.normalize().to_string())
            .unwrap_or_else(|| NOT_FOUND.to_string())
    }

    /// Record the categories read from a detail page.
    pub fn apply_categories(&mut self, categories: Vec<String>) {
        if categories.is_empty() {
            self.categories = Some(vec![OTHER_CATEGORY.to_string()]);
        } else {
            self.categories = Some(categories);
        }
    }

    /// Leave the record eligible for another categorization attempt.
    pub fn mark_categories_failed(&mut self) {
        self.categories = Some(Vec::new());
    }

    pub fn needs_categories(&self) -> bool {
        self.categories.as_ref().is_none_or(|c| c.is_empty())
    }
}
