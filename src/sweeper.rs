use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::store::{ReceiptStore, StoreError};

/// Delete persisted receipts whose age exceeds `retention_days` whole days.
/// A record exactly `retention_days` old is kept.
#[instrument(skip_all, fields(retention_days = retention_days))]
pub async fn sweep_at(
    store: &ReceiptStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let mut removed = Vec::new();
    for record in store.list().await? {
        if store.delete_if_older_than(&record, retention_days, now).await? {
            info!(
                full_number = %record.full_number,
                retention_days,
                "receipt removed after retention window"
            );
            removed.push(record.full_number);
        }
    }
    Ok(removed)
}

pub async fn sweep(store: &ReceiptStore, retention_days: u32) -> Result<Vec<String>, StoreError> {
    sweep_at(store, retention_days, Utc::now()).await
}
