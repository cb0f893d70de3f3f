use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::models::{Fingerprint, ProductRecord, ProductUpdate, PurchaseWindow};
use crate::utils::error::Result;

const CATEGORY_SEPARATOR: &str = ", ";

/// Answers whether an offer with a given fingerprint is already stored.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FingerprintLookup: Send + Sync {
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<bool>;
}

#[async_trait]
pub trait ProductStore: FingerprintLookup {
    /// Returns `false` when the fingerprint was already stored and nothing was written.
    async fn insert(&self, record: &ProductRecord) -> Result<bool>;

    /// Returns `false` when no stored offer has this fingerprint.
    async fn update_by_fingerprint(&self, fingerprint: &Fingerprint, update: &ProductUpdate) -> Result<bool>;

    /// Stored offers whose categories were never resolved.
    async fn records_missing_categories(&self) -> Result<Vec<ProductRecord>>;
}

/// A stored offer with its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct StoredProduct {
    pub record: ProductRecord,
    pub original_count: Option<i64>,
    pub last_updated: NaiveDateTime,
}

#[derive(Debug, FromRow)]
struct ProductRow {
    item_id: String,
    fingerprint: String,
    product_name: Option<String>,
    brand: Option<String>,
    image_url: Option<String>,
    price: Option<String>,
    purchase_start_time: NaiveDateTime,
    purchase_end_time: NaiveDateTime,
    countdown: Option<i64>,
    original_count: Option<i64>,
    category: String,
    last_updated: NaiveDateTime,
}

impl From<ProductRow> for StoredProduct {
    fn from(row: ProductRow) -> Self {
        let window = PurchaseWindow {
            start: row.purchase_start_time,
            end: row.purchase_end_time,
        };
        let mut record = ProductRecord::restore(
            row.item_id,
            Fingerprint::from_stored(row.fingerprint),
            window,
            row.brand,
            row.product_name,
        );
        record.image_url = row.image_url;
        record.price = row.price.as_deref().and_then(|p| Decimal::from_str(p).ok());
        record.countdown = row.countdown;
        record.categories = Some(split_categories(&row.category));

        StoredProduct {
            record,
            original_count: row.original_count,
            last_updated: row.last_updated,
        }
    }
}

fn join_categories(categories: &[String]) -> String {
    categories.join(CATEGORY_SEPARATOR)
}

fn split_categories(column: &str) -> Vec<String> {
    column
        .split(CATEGORY_SEPARATOR)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

const SELECT_COLUMNS: &str = "item_id, fingerprint, product_name, brand, image_url, price, \
     purchase_start_time, purchase_end_time, countdown, original_count, category, last_updated";

#[derive(Clone)]
pub struct SqliteProductStore {
    pool: SqlitePool,
}

impl SqliteProductStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database, handy for dry runs and tests. A single
    /// connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<StoredProduct>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {} FROM products WHERE fingerprint = ?1",
            SELECT_COLUMNS
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredProduct::from))
    }

    /// Offers whose purchase window ends on `date`, one per item id.
    pub async fn products_ending_on(&self, date: NaiveDate) -> Result<Vec<StoredProduct>> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {} FROM products WHERE id IN ( \
                 SELECT MIN(id) FROM products WHERE date(purchase_end_time) = ?1 GROUP BY item_id \
             ) ORDER BY purchase_start_time, id",
            SELECT_COLUMNS
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredProduct::from).collect())
    }

    /// Every category name seen so far, sorted.
    pub async fn distinct_categories(&self) -> Result<Vec<String>> {
        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT category FROM products WHERE category != ''")
                .fetch_all(&self.pool)
                .await?;

        let categories: BTreeSet<String> = columns
            .iter()
            .flat_map(|(column,)| split_categories(column))
            .collect();
        Ok(categories.into_iter().collect())
    }

    /// Offers ending on `date` that carry `category`.
    pub async fn products_in_category(&self, category: &str, date: NaiveDate) -> Result<Vec<StoredProduct>> {
        let products = self.products_ending_on(date).await?;
        Ok(products
            .into_iter()
            .filter(|p| {
                p.record
                    .categories
                    .as_ref()
                    .is_some_and(|c| c.iter().any(|name| name == category))
            })
            .collect())
    }
}

#[async_trait]
impl FingerprintLookup for SqliteProductStore {
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM products WHERE fingerprint = ?1")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn insert(&self, record: &ProductRecord) -> Result<bool> {
        let categories = record
            .categories
            .as_deref()
            .map(join_categories)
            .unwrap_or_default();

        let result = sqlx::query(
            "INSERT INTO products ( \
                 item_id, fingerprint, product_name, brand, image_url, price, \
                 purchase_start_time, purchase_end_time, countdown, original_count, \
                 category, last_updated \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?11) \
             ON CONFLICT(fingerprint) DO NOTHING",
        )
        .bind(record.external_id())
        .bind(record.fingerprint().as_str())
        .bind(record.product_name())
        .bind(record.brand())
        .bind(record.image_url.as_deref())
        .bind(record.price.map(|p| p.to_string()))
        .bind(record.window().start)
        .bind(record.window().end)
        .bind(record.countdown)
        .bind(categories)
        .bind(Local::now().naive_local())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_by_fingerprint(&self, fingerprint: &Fingerprint, update: &ProductUpdate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE products SET \
                 price = COALESCE(?1, price), \
                 countdown = COALESCE(?2, countdown), \
                 category = COALESCE(?3, category), \
                 last_updated = ?4 \
             WHERE fingerprint = ?5",
        )
        .bind(update.price.map(|p| p.to_string()))
        .bind(update.countdown)
        .bind(update.categories.as_deref().map(join_categories))
        .bind(Local::now().naive_local())
        .bind(fingerprint.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn records_missing_categories(&self) -> Result<Vec<ProductRecord>> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {} FROM products WHERE category = '' ORDER BY id",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredProduct::from(row).record)
            .collect())
    }
}
