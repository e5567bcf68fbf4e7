use pricefeed_queue::{MessageSource, QueueError};
use serde::Serialize;
use tracing::{info, warn};

use crate::coordinator::BatchCoordinator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    pub ok: bool,
    pub received: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Receives one batch, processes it and acknowledges only persisted messages.
/// Everything else stays on the queue for redelivery.
pub async fn consume_one_batch(
    source: &dyn MessageSource,
    coordinator: &BatchCoordinator,
) -> Result<ConsumeSummary, QueueError> {
    let messages = source.receive_batch().await?;
    if messages.is_empty() {
        info!("no messages received");
        return Ok(ConsumeSummary {
            ok: true,
            ..ConsumeSummary::default()
        });
    }

    let report = coordinator.process_batch(&messages).await;
    for (message, outcome) in messages.iter().zip(&report.outcomes) {
        if !outcome.outcome.is_success() {
            continue;
        }
        if let Err(err) = source.acknowledge(message).await {
            warn!(message_id = %message.message_id, error = %err, "acknowledge failed");
        }
    }

    Ok(ConsumeSummary {
        ok: true,
        received: messages.len(),
        processed: report.processed_count(),
        failed: report.failed_count(),
    })
}
