//! JSON invocation envelope shared by the HTTP surface and `pricefeed-cli invoke`.

use pricefeed_core::RawMessage;
use pricefeed_storage::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::coordinator::{BatchCoordinator, BatchResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    Setup,
    Probe,
    Count,
}

/// Reads one `Records` entry without rejecting it, so a malformed record only
/// fails itself. A missing or null `messageId` becomes `"unknown"`; a body that
/// is not a string is carried as its JSON text and left to the decoder.
pub fn record_to_message(record: &JsonValue) -> RawMessage {
    let message_id = match record.get("messageId") {
        Some(JsonValue::String(id)) => id.clone(),
        None | Some(JsonValue::Null) => "unknown".to_string(),
        Some(other) => other.to_string(),
    };
    let body = match record.get("body") {
        Some(JsonValue::String(body)) => body.clone(),
        None => String::new(),
        Some(other) => other.to_string(),
    };
    RawMessage::new(message_id, body)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InvocationEvent {
    Admin { action: AdminAction },
    Batch {
        #[serde(rename = "Records")]
        records: Vec<JsonValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InvocationResponse {
    Setup { ok: bool, setup: &'static str },
    Probe { ok: bool },
    Count { count: i64 },
    Batch(BatchResponse),
    Error { error: &'static str },
}

impl InvocationResponse {
    pub fn unexpected_shape() -> Self {
        InvocationResponse::Error {
            error: "Unexpected event shape",
        }
    }
}

/// Admin actions surface store errors; batches always answer with data.
pub async fn handle_event(
    coordinator: &BatchCoordinator,
    event: InvocationEvent,
) -> Result<InvocationResponse, StoreError> {
    match event {
        InvocationEvent::Admin { action } => {
            info!(action = ?action, "admin invocation");
            let store = coordinator.store();
            Ok(match action {
                AdminAction::Setup => {
                    store.ensure_schema().await?;
                    InvocationResponse::Setup {
                        ok: true,
                        setup: "done",
                    }
                }
                AdminAction::Probe => {
                    store.probe().await?;
                    InvocationResponse::Probe { ok: true }
                }
                AdminAction::Count => InvocationResponse::Count {
                    count: store.count().await?,
                },
            })
        }
        InvocationEvent::Batch { records } => {
            let messages: Vec<RawMessage> = records.iter().map(record_to_message).collect();
            let report = coordinator.process_batch(&messages).await;
            Ok(InvocationResponse::Batch(report.into_response()))
        }
    }
}

pub async fn handle_value(
    coordinator: &BatchCoordinator,
    value: JsonValue,
) -> Result<InvocationResponse, StoreError> {
    match serde_json::from_value::<InvocationEvent>(value) {
        Ok(event) => handle_event(coordinator, event).await,
        Err(err) => {
            warn!(error = %err, "unrecognized invocation event");
            Ok(InvocationResponse::unexpected_shape())
        }
    }
}
