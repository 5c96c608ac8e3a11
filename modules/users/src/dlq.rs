//! Dead-letter routing for messages that exhausted their redeliveries

use event_bus::{BusResult, Delivery, DeliveryMetadata, EventBus};

/// Dedup key of a dead-lettered message. Stable per original stream sequence,
/// so a retried forward inside the duplicate window lands once.
pub fn dedup_key(stream_sequence: u64) -> String {
    format!("dlq-{}", stream_sequence)
}

/// Publish the original payload, unchanged, to `dlq_subject`.
pub async fn forward(
    bus: &dyn EventBus,
    dlq_subject: &str,
    delivery: &Delivery,
    metadata: DeliveryMetadata,
) -> BusResult<()> {
    let key = dedup_key(metadata.stream_sequence);
    bus.publish(dlq_subject, delivery.payload.clone(), Some(&key))
        .await
}
