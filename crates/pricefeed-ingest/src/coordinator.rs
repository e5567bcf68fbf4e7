//! Per-message pipeline and batch orchestration.
//!
//! Every message runs decode -> normalize -> validate -> flatten -> upsert on
//! its own. Failures never abort the batch; they become [`MessageOutcome`]s.

use std::sync::Arc;

use pricefeed_core::{DeadLetter, RawDocument, RawMessage};
use pricefeed_queue::DeadLetterSink;
use pricefeed_storage::PriceStore;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::decode::{decode_body, decode_bytes};
use crate::flatten::to_rows;
use crate::metrics::{Metrics, MetricsTimer};
use crate::normalize::Normalizer;
use crate::validate::validate;
use crate::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Persisted { rows: u64 },
    /// Terminal failure: the payload can never be ingested as sent.
    Rejected { reason: String, dead_lettered: bool },
    /// Storage failure: the message should be redelivered.
    Deferred { reason: String, retryable: bool },
}

impl MessageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MessageOutcome::Persisted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReport {
    pub message_id: String,
    pub outcome: MessageOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<MessageReport>,
}

/// Wire shape of a batch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Upserted {
        ok: bool,
        upserted: u64,
    },
    Failures {
        #[serde(rename = "batchItemFailures")]
        batch_item_failures: Vec<ItemFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

impl BatchReport {
    pub fn processed_count(&self) -> usize {
        self.outcomes.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.processed_count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn upserted(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|r| match r.outcome {
                MessageOutcome::Persisted { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|r| !r.outcome.is_success())
            .map(|r| r.message_id.as_str())
            .collect()
    }

    pub fn into_response(self) -> BatchResponse {
        if self.has_failures() {
            BatchResponse::Failures {
                batch_item_failures: self
                    .failed_ids()
                    .into_iter()
                    .map(|id| ItemFailure {
                        item_identifier: id.to_string(),
                    })
                    .collect(),
            }
        } else {
            BatchResponse::Upserted {
                ok: true,
                upserted: self.upserted(),
            }
        }
    }
}

pub struct BatchCoordinator {
    normalizer: Normalizer,
    store: Arc<dyn PriceStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<dyn Metrics>,
}

impl BatchCoordinator {
    pub fn new(
        normalizer: Normalizer,
        store: Arc<dyn PriceStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            normalizer,
            store,
            dead_letters,
            metrics,
        }
    }

    pub fn store(&self) -> &dyn PriceStore {
        self.store.as_ref()
    }

    /// Normalize, validate, flatten and upsert one document. Returns rows written.
    pub async fn process_document(&self, raw: &RawDocument) -> Result<u64, IngestError> {
        let canonical = self.normalizer.normalize(raw)?;
        let validated = validate(&canonical)?;
        let rows = to_rows(&validated);
        let written = self.store.upsert(&rows).await?;
        self.metrics.incr("db.upserted", written);
        Ok(written)
    }

    pub async fn process_body(&self, body: &str) -> Result<u64, IngestError> {
        let raw = decode_body(body)?;
        self.process_document(&raw).await
    }

    /// Single-document entry point used for local files.
    pub async fn process_file_contents(&self, bytes: &[u8]) -> Result<u64, IngestError> {
        let _timer = MetricsTimer::start(self.metrics.as_ref(), "ingest.file.ms");
        let raw = decode_bytes(bytes)?;
        self.process_document(&raw).await
    }

    pub async fn process_message(&self, message: &RawMessage) -> MessageReport {
        let outcome = match self.process_body(&message.body).await {
            Ok(rows) => {
                self.metrics.incr("msg.ok", 1);
                debug!(message_id = %message.message_id, rows, "message persisted");
                MessageOutcome::Persisted { rows }
            }
            Err(err) if err.is_terminal() => {
                self.metrics.incr("msg.invalid", 1);
                let reason = err.to_string();
                warn!(message_id = %message.message_id, error = %reason, "message rejected");
                let dead_lettered = self.dead_letter(message, &reason).await;
                MessageOutcome::Rejected {
                    reason,
                    dead_lettered,
                }
            }
            Err(err) => {
                self.metrics.incr("msg.deferred", 1);
                let retryable = err.is_retryable();
                error!(
                    message_id = %message.message_id,
                    error = %err,
                    retryable,
                    "storage failure; leaving message for redelivery"
                );
                MessageOutcome::Deferred {
                    reason: err.to_string(),
                    retryable,
                }
            }
        };
        MessageReport {
            message_id: message.message_id.clone(),
            outcome,
        }
    }

    async fn dead_letter(&self, message: &RawMessage, reason: &str) -> bool {
        let letter = DeadLetter::new(reason, message.body.clone());
        match self.dead_letters.send(&letter).await {
            Ok(()) => {
                self.metrics.incr("dlq.sent", 1);
                true
            }
            Err(err) => {
                self.metrics.incr("dlq.failed", 1);
                error!(
                    message_id = %message.message_id,
                    sink = self.dead_letters.name(),
                    error = %err,
                    "dead-letter delivery failed"
                );
                false
            }
        }
    }

    /// Messages run sequentially; order within a batch carries no meaning.
    pub async fn process_batch(&self, messages: &[RawMessage]) -> BatchReport {
        let span = info_span!("ingest_batch", batch_id = %Uuid::new_v4(), size = messages.len());
        async {
            let _timer = MetricsTimer::start(self.metrics.as_ref(), "ingest.batch.ms");
            let mut outcomes = Vec::with_capacity(messages.len());
            for message in messages {
                outcomes.push(self.process_message(message).await);
            }
            let report = BatchReport { outcomes };
            info!(
                processed = report.processed_count(),
                failed = report.failed_count(),
                upserted = report.upserted(),
                "batch complete"
            );
            report
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, outcome: MessageOutcome) -> MessageReport {
        MessageReport {
            message_id: id.into(),
            outcome,
        }
    }

    #[test]
    fn clean_batch_reports_upserted_total() {
        let report = BatchReport {
            outcomes: vec![
                report("a", MessageOutcome::Persisted { rows: 2 }),
                report("b", MessageOutcome::Persisted { rows: 3 }),
            ],
        };
        assert!(!report.has_failures());
        assert_eq!(
            serde_json::to_value(report.into_response()).unwrap(),
            serde_json::json!({"ok": true, "upserted": 5})
        );
    }

    #[test]
    fn failures_list_only_failed_identifiers() {
        let report = BatchReport {
            outcomes: vec![
                report("a", MessageOutcome::Persisted { rows: 2 }),
                report(
                    "b",
                    MessageOutcome::Rejected {
                        reason: "bad".into(),
                        dead_lettered: true,
                    },
                ),
                report(
                    "c",
                    MessageOutcome::Deferred {
                        reason: "db down".into(),
                        retryable: true,
                    },
                ),
            ],
        };
        assert_eq!(report.processed_count(), 1);
        assert_eq!(report.failed_count(), 2);
        assert_eq!(report.failed_ids(), vec!["b", "c"]);
        assert_eq!(
            serde_json::to_value(report.into_response()).unwrap(),
            serde_json::json!({"batchItemFailures": [
                {"itemIdentifier": "b"},
                {"itemIdentifier": "c"}
            ]})
        );
    }

    #[test]
    fn empty_batch_is_a_clean_zero() {
        let report = BatchReport::default();
        assert_eq!(report.into_response(), BatchResponse::Upserted { ok: true, upserted: 0 });
    }
}
