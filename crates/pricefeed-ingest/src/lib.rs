//! Price document ingestion: decoding, normalization, validation, flattening
//! and batch coordination over a [`PriceStore`](pricefeed_storage::PriceStore).

use std::sync::Arc;

use pricefeed_storage::{PgPriceStore, StoreError};
use thiserror::Error;

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod flatten;
pub mod invocation;
pub mod metrics;
pub mod normalize;
pub mod runner;
pub mod validate;

pub use config::{ConfigError, IngestConfig, QueueConfig};
pub use coordinator::{
    BatchCoordinator, BatchReport, BatchResponse, ItemFailure, MessageOutcome, MessageReport,
};
pub use decode::{decode_body, decode_bytes, DecodeError};
pub use flatten::to_rows;
pub use invocation::{
    handle_event, handle_value, record_to_message, AdminAction, InvocationEvent,
    InvocationResponse,
};
pub use metrics::{Metrics, MetricsTimer, TracingMetrics};
pub use normalize::{NormalizeDefaults, NormalizeError, Normalizer};
pub use runner::{consume_one_batch, ConsumeSummary};
pub use validate::{validate, ValidatedDocument, ValidationError};

pub const CRATE_NAME: &str = "pricefeed-ingest";

/// Why a single message could not be ingested.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Timestamp(#[from] NormalizeError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl IngestError {
    /// The payload itself is at fault; redelivery cannot help.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IngestError::Storage(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Wires a Postgres-backed coordinator from configuration.
pub async fn coordinator_from_config(config: &IngestConfig) -> anyhow::Result<BatchCoordinator> {
    let store = PgPriceStore::new(&config.database)?;
    let dead_letters = config.dead_letter_sink().await;
    Ok(BatchCoordinator::new(
        Normalizer::new(config.defaults.clone()),
        Arc::new(store),
        dead_letters,
        Arc::new(TracingMetrics::new()),
    ))
}
