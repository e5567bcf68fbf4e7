//! Price row persistence, failure classification and the local dead-letter spool.

use std::path::PathBuf;

use async_trait::async_trait;
use pricefeed_core::PriceRow;
use thiserror::Error;

mod memory;
mod postgres;
mod spool;

pub use memory::{MemoryPriceStore, StoredRow};
pub use postgres::{PgPriceStore, PgStoreConfig, PgTarget, PRICE_ITEMS_DDL};
pub use spool::{DeadLetterSpool, SpooledLetter};

pub const CRATE_NAME: &str = "pricefeed-storage";

/// Idempotent persistence of price rows keyed by
/// `(provider, branch, doc_type, ts, product)`.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Writes every row or none of them. Returns the number of rows written.
    async fn upsert(&self, rows: &[PriceRow]) -> Result<u64, StoreError>;

    /// Creates the price table and its snapshot index if absent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Trivial round trip to check the store is reachable.
    async fn probe(&self) -> Result<(), StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading migration {}: {source}", path.display())]
    Migration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Connect(err) | StoreError::Query { source: err, .. } => {
                classify_sqlx_error(err)
            }
            StoreError::Migration { .. } => RetryDisposition::NonRetryable,
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// SQLSTATE classes worth another delivery: connection exceptions,
/// transaction rollbacks, insufficient resources and operator intervention.
const RETRYABLE_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code)
                if RETRYABLE_SQLSTATE_CLASSES
                    .iter()
                    .any(|class| code.starts_with(class)) =>
            {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_sqlx_error(&io), RetryDisposition::Retryable);
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert!(StoreError::Connect(io).is_retryable());
    }

    #[test]
    fn decode_and_migration_failures_are_not_retryable() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
        let err = StoreError::Migration {
            path: PathBuf::from("missing.sql"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("missing.sql"));
    }

    #[test]
    fn outages_are_retryable() {
        assert!(StoreError::Unavailable("maintenance".into()).is_retryable());
    }
}
