use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricefeed_core::{NaturalKey, PriceRow};
use tokio::sync::Mutex;

use crate::{PriceStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row: PriceRow,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    schema_ready: bool,
    rows: BTreeMap<NaturalKey, StoredRow>,
}

/// In-process store with the same upsert contract as Postgres.
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<StoredRow> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<StoredRow> {
        self.state.lock().await.rows.get(key).cloned()
    }

    pub async fn schema_ready(&self) -> bool {
        self.state.lock().await.schema_ready
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn upsert(&self, rows: &[PriceRow]) -> Result<u64, StoreError> {
        self.check_available()?;
        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .rows
                .entry(row.natural_key())
                .and_modify(|stored| {
                    stored.row.unit = row.unit.clone();
                    stored.row.price = row.price;
                    stored.row.src_key = row.src_key.clone();
                    stored.row.etag = row.etag.clone();
                    stored.updated_at = now;
                })
                .or_insert_with(|| StoredRow {
                    row: row.clone(),
                    updated_at: now,
                });
        }
        Ok(rows.len() as u64)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().await.schema_ready = true;
        Ok(())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn count(&self) -> Result<i64, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.rows.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pricefeed_core::DocType;

    fn row(product: &str, price: f64) -> PriceRow {
        PriceRow {
            provider: "shufersal".into(),
            branch: "001".into(),
            doc_type: DocType::PricesFull,
            ts: Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).single().unwrap(),
            product: product.into(),
            unit: "unit".into(),
            price,
            src_key: Some("prices/shufersal/001.gz".into()),
            etag: None,
        }
    }

    #[tokio::test]
    async fn reupsert_overwrites_values_but_keeps_key() {
        let store = MemoryPriceStore::new();
        assert_eq!(store.upsert(&[row("milk", 5.9), row("bread", 7.5)]).await.unwrap(), 2);
        let first = store.get(&row("milk", 0.0).natural_key()).await.unwrap();

        let mut changed = row("milk", 6.1);
        changed.unit = "liter".into();
        changed.etag = Some("\"abc\"".into());
        assert_eq!(store.upsert(&[changed]).await.unwrap(), 1);

        let second = store.get(&row("milk", 0.0).natural_key()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(second.row.natural_key(), first.row.natural_key());
        assert_eq!(second.row.price, 6.1);
        assert_eq!(second.row.unit, "liter");
        assert_eq!(second.row.etag.as_deref(), Some("\"abc\""));
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn empty_upsert_is_a_noop() {
        let store = MemoryPriceStore::new();
        assert_eq!(store.upsert(&[]).await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_writes_nothing() {
        let store = MemoryPriceStore::new();
        store.set_unavailable(true);
        let err = store.upsert(&[row("milk", 5.9)]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.probe().await.is_err());

        store.set_unavailable(false);
        assert_eq!(store.count().await.unwrap(), 0);
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(store.schema_ready().await);
    }
}
