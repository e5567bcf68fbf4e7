//! Queue transport contracts plus SQS, in-memory and dead-letter implementations.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use chrono::Utc;
use pricefeed_core::{DeadLetter, RawMessage};
use pricefeed_storage::DeadLetterSpool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub const CRATE_NAME: &str = "pricefeed-queue";

/// SQS caps a single receive at ten messages.
pub const MAX_RECEIVE_BATCH: i32 = 10;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("message {0} has no receipt handle")]
    MissingReceipt(String),
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Spool(#[from] anyhow::Error),
}

/// At-least-once source of raw messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive_batch(&self) -> Result<Vec<RawMessage>, QueueError>;

    /// Removes a delivery so it is not redelivered.
    async fn acknowledge(&self, message: &RawMessage) -> Result<(), QueueError>;
}

/// Destination for messages that can never be ingested.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: i32,
    pub wait_seconds: i32,
    pub visibility_timeout: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: MAX_RECEIVE_BATCH,
            wait_seconds: 10,
            visibility_timeout: 30,
        }
    }
}

impl ReceiveOptions {
    pub fn clamped_max_messages(&self) -> i32 {
        self.max_messages.clamp(1, MAX_RECEIVE_BATCH)
    }
}

pub async fn sqs_client(region: &str) -> aws_sdk_sqs::Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;
    aws_sdk_sqs::Client::new(&config)
}

fn transport_err<E>(operation: &'static str) -> impl FnOnce(E) -> QueueError
where
    E: std::error::Error,
{
    move |err| QueueError::Transport {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    options: ReceiveOptions,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>, options: ReceiveOptions) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            options,
        }
    }
}

#[async_trait]
impl MessageSource for SqsQueue {
    async fn receive_batch(&self) -> Result<Vec<RawMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.options.clamped_max_messages())
            .wait_time_seconds(self.options.wait_seconds)
            .visibility_timeout(self.options.visibility_timeout)
            .send()
            .await
            .map_err(transport_err("receive_message"))?;

        Ok(output
            .messages()
            .iter()
            .map(|m| RawMessage {
                message_id: m.message_id().unwrap_or("unknown").to_string(),
                body: m.body().unwrap_or_default().to_string(),
                receipt_handle: m.receipt_handle().map(ToString::to_string),
            })
            .collect())
    }

    async fn acknowledge(&self, message: &RawMessage) -> Result<(), QueueError> {
        let Some(handle) = message.receipt_handle.as_deref() else {
            return Err(QueueError::MissingReceipt(message.message_id.clone()));
        };
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle)
            .send()
            .await
            .map_err(transport_err("delete_message"))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqsDeadLetterSink {
    client: aws_sdk_sqs::Client,
    dlq_url: String,
}

impl SqsDeadLetterSink {
    pub fn new(client: aws_sdk_sqs::Client, dlq_url: impl Into<String>) -> Self {
        Self {
            client,
            dlq_url: dlq_url.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterSink {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.client
            .send_message()
            .queue_url(&self.dlq_url)
            .message_body(letter.to_json())
            .send()
            .await
            .map_err(|err| DeadLetterError::Transport(DisplayErrorContext(err).to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterSpool {
    fn name(&self) -> &'static str {
        "spool"
    }

    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let stored = self.store(Utc::now(), letter.to_json().as_bytes()).await?;
        debug!(
            path = %stored.absolute_path.display(),
            deduplicated = stored.deduplicated,
            "dead letter spooled"
        );
        Ok(())
    }
}

const LOG_PREVIEW_CHARS: usize = 500;

fn preview(body: &str, max_chars: usize) -> &str {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Used when no dead-letter destination is configured: the letter is logged and dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogOnlyDeadLetterSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        error!(
            error = %letter.error,
            body = preview(&letter.original, LOG_PREVIEW_CHARS),
            "no dead-letter destination configured; dropping invalid message"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    pending: VecDeque<RawMessage>,
    in_flight: HashMap<String, RawMessage>,
    acknowledged: Vec<String>,
    deliveries: u64,
}

/// In-process queue with visibility semantics close enough to SQS for tests:
/// received messages stay in flight until acknowledged or redelivered.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    options: ReceiveOptions,
}

impl MemoryQueue {
    pub fn new(options: ReceiveOptions) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            options,
        }
    }

    pub async fn push(&self, message: RawMessage) {
        self.state.lock().await.pending.push_back(message);
    }

    /// Simulates visibility timeout expiry for everything still in flight.
    pub async fn redeliver_unacknowledged(&self) -> usize {
        let mut state = self.state.lock().await;
        let expired = state.in_flight.drain().map(|(_, m)| m).collect::<Vec<_>>();
        let n = expired.len();
        state.pending.extend(expired);
        n
    }

    pub async fn acknowledged(&self) -> Vec<String> {
        self.state.lock().await.acknowledged.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn receive_batch(&self) -> Result<Vec<RawMessage>, QueueError> {
        let mut state = self.state.lock().await;
        let take = (self.options.clamped_max_messages() as usize).min(state.pending.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(message) = state.pending.pop_front() else {
                break;
            };
            state.deliveries += 1;
            let receipt = format!("{}#{}", message.message_id, state.deliveries);
            let delivered = message.with_receipt_handle(receipt.clone());
            state.in_flight.insert(receipt, delivered.clone());
            batch.push(delivered);
        }
        Ok(batch)
    }

    async fn acknowledge(&self, message: &RawMessage) -> Result<(), QueueError> {
        let Some(handle) = message.receipt_handle.as_deref() else {
            return Err(QueueError::MissingReceipt(message.message_id.clone()));
        };
        let mut state = self.state.lock().await;
        if state.in_flight.remove(handle).is_none() {
            return Err(QueueError::Transport {
                operation: "delete_message",
                message: format!("receipt handle {handle} is not in flight"),
            });
        }
        state.acknowledged.push(message.message_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn receive_batch_size_is_clamped_to_sqs_limits() {
        let mut options = ReceiveOptions::default();
        options.max_messages = 50;
        assert_eq!(options.clamped_max_messages(), 10);
        options.max_messages = 0;
        assert_eq!(options.clamped_max_messages(), 1);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("שלום עולם", 4), "שלום");
        assert_eq!(preview("short", 500), "short");
    }

    #[tokio::test]
    async fn memory_queue_redelivers_only_unacknowledged_messages() {
        let queue = MemoryQueue::new(ReceiveOptions {
            max_messages: 2,
            ..ReceiveOptions::default()
        });
        for id in ["m1", "m2", "m3"] {
            queue.push(RawMessage::new(id, "{}")).await;
        }

        let batch = queue.receive_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        queue.acknowledge(&batch[0]).await.unwrap();
        assert!(queue.acknowledge(&batch[0]).await.is_err());
        assert!(queue
            .acknowledge(&RawMessage::new("m9", "{}"))
            .await
            .is_err());

        assert_eq!(queue.redeliver_unacknowledged().await, 1);
        let ids = queue
            .receive_batch()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["m3", "m2"]);
        assert_eq!(queue.acknowledged().await, vec!["m1"]);
    }

    #[tokio::test]
    async fn spool_sink_writes_letter_json() {
        let dir = tempdir().unwrap();
        let spool = DeadLetterSpool::new(dir.path());
        let letter = DeadLetter::new("'provider' is too short", r#"{"items":[]}"#);

        spool.send(&letter).await.unwrap();
        spool.send(&letter).await.unwrap();

        let day_dirs = std::fs::read_dir(dir.path()).unwrap().collect::<Vec<_>>();
        assert_eq!(day_dirs.len(), 1);
        let files = std::fs::read_dir(day_dirs[0].as_ref().unwrap().path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(files.len(), 1);
        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
        assert_eq!(stored["original"], r#"{"items":[]}"#);
    }

    #[tokio::test]
    async fn log_only_sink_never_fails() {
        let long_body = "x".repeat(2_000);
        LogOnlyDeadLetterSink
            .send(&DeadLetter::new("bad", long_body))
            .await
            .unwrap();
    }
}
