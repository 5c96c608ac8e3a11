//! Stream and consumer declarations derived from configuration

use crate::config::Config;
use event_bus::{ensure_consumer, ensure_stream, BusResult, ConsumerSpec, StreamSpec, TopologyAdmin};
use tracing::info;

/// Stream capturing every routed subject plus the dead-letter subject.
pub fn stream_spec(config: &Config) -> StreamSpec {
    let mut subjects = config.subject_router().routed_subjects();
    if let Some(dlq) = &config.dlq_subject {
        if !subjects.contains(dlq) {
            subjects.push(dlq.clone());
        }
    }

    StreamSpec {
        name: config.stream.clone(),
        subjects,
        duplicate_window: config.duplicate_window,
    }
}

/// Server-side redelivery limit of the durable consumer.
///
/// The dead-letter threshold (`NATS_CONSUMER_MAX_DELIVER`) is applied by the
/// consumer itself, so the bus must keep redelivering past it: a message whose
/// DLQ publish failed on the last counted delivery still comes back.
pub const SERVER_MAX_DELIVER: i64 = -1;

/// Durable consumer declaration. The bus never drops a message on its own;
/// see [`SERVER_MAX_DELIVER`].
pub fn consumer_spec(config: &Config) -> ConsumerSpec {
    ConsumerSpec {
        durable: config.consumer_durable.clone(),
        filter_subject: config.user_created_subject.clone(),
        ack_wait: config.ack_wait,
        max_ack_pending: config.max_ack_pending,
        max_deliver: SERVER_MAX_DELIVER,
        backoff: config.backoff.clone(),
    }
}

/// Reconcile the stream the relay publishes into.
pub async fn ensure_relay_topology<A>(admin: &A, config: &Config) -> BusResult<()>
where
    A: TopologyAdmin + ?Sized,
{
    let outcome = ensure_stream(admin, &stream_spec(config)).await?;
    info!(stream = %config.stream, outcome = ?outcome, "Stream reconciled");
    Ok(())
}

/// Reconcile the stream and the durable consumer the audit consumer binds to.
pub async fn ensure_consumer_topology<A>(admin: &A, config: &Config) -> BusResult<()>
where
    A: TopologyAdmin + ?Sized,
{
    ensure_relay_topology(admin, config).await?;
    let outcome = ensure_consumer(admin, &config.stream, &consumer_spec(config)).await?;
    info!(
        stream = %config.stream,
        durable = %config.consumer_durable,
        outcome = ?outcome,
        "Consumer reconciled"
    );
    Ok(())
}
