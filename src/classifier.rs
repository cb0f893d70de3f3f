use crate::models::ProductRecord;
use crate::store::FingerprintLookup;

/// Listing records split by whether their offer is already stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub to_insert: Vec<ProductRecord>,
    pub to_update: Vec<ProductRecord>,
    /// Records left out because the lookup itself failed.
    pub skipped: usize,
}

impl Classification {
    pub fn total(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.skipped
    }
}

/// Stable partition of `records` by fingerprint lookup, one lookup per record.
///
/// A record whose lookup fails lands in neither list; the failure is logged
/// and not retried here.
pub async fn classify<L>(records: Vec<ProductRecord>, lookup: &L) -> Classification
where
    L: FingerprintLookup + ?Sized,
{
    let mut classification = Classification::default();

    for record in records {
        match lookup.exists_by_fingerprint(record.fingerprint()).await {
            Ok(true) => classification.to_update.push(record),
            Ok(false) => classification.to_insert.push(record),
            Err(e) => {
                tracing::warn!(
                    item_id = record.external_id(),
                    fingerprint = %record.fingerprint(),
                    error = %e,
                    "Fingerprint lookup failed, skipping record"
                );
                classification.skipped += 1;
            }
        }
    }

    tracing::info!(
        new = classification.to_insert.len(),
        known = classification.to_update.len(),
        skipped = classification.skipped,
        "Classified listing records"
    );
    classification
}
