use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::ProductRecord;

/// Mutable fields of a stored offer. `None` leaves the stored value as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductUpdate {
    pub price: Option<Decimal>,
    pub countdown: Option<i64>,
    pub categories: Option<Vec<String>>,
}

impl ProductUpdate {
    /// Fresh listing values for an offer that is already stored.
    pub fn from_listing(record: &ProductRecord) -> Self {
        Self {
            price: record.price,
            countdown: record.countdown,
            categories: None,
        }
    }

    /// Categories resolved for a backlog record. Failed fetches produce an
    /// update that touches nothing but the timestamp.
    pub fn from_categories(record: &ProductRecord) -> Self {
        Self {
            price: None,
            countdown: None,
            categories: record.categories.clone().filter(|c| !c.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.countdown.is_none() && self.categories.is_none()
    }
}
