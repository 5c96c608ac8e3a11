//! Durable audit consumer
//!
//! Pulls batches from a durable subscription and records each message in the
//! audit log. Failed messages are redelivered on the configured backoff
//! schedule until the bus-reported delivery count reaches `max_deliver`, after
//! which they are routed to the dead-letter subject.

use crate::dlq;
use crate::metrics::Metrics;
use crate::models::AuditEntry;
use crate::shutdown;
use crate::store::{AuditLog, StoreError};
use async_trait::async_trait;
use event_bus::{backoff_for_attempt, BusError, Delivery, DeliveryMetadata, EventBus, PullSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConsumerConfig {
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
    /// Delivery count at which a failing message is dead-lettered; at least 1
    pub max_deliver: u64,
    pub backoff: Vec<Duration>,
    /// `None` acknowledges exhausted messages without keeping them anywhere
    pub dlq_subject: Option<String>,
}

impl Default for DurableConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_batch: 50,
            fetch_wait: Duration::from_secs(2),
            max_deliver: 10,
            backoff: Vec::new(),
            dlq_subject: Some("user.created.dlq".to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Side effect applied to each delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Records every message as an audit entry keyed by its subject.
pub struct AuditRecorder<A> {
    audit: A,
}

impl<A: AuditLog> AuditRecorder<A> {
    pub fn new(audit: A) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl<A: AuditLog> MessageHandler for AuditRecorder<A> {
    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let payload: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        self.audit
            .record(&AuditEntry {
                event_type: subject.to_string(),
                payload,
            })
            .await?;
        Ok(())
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    /// Negatively acknowledged; `None` leaves timing to the bus
    Redelivered { delay: Option<Duration> },
    DeadLettered,
    /// Dead-letter publish failed, so the original was negatively acknowledged
    DeadLetterFailed,
    /// Exhausted with no dead-letter subject configured; acknowledged and lost
    Dropped,
    MetadataUnreadable,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledged => "ack",
            Disposition::Redelivered { .. } => "nak",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::DeadLetterFailed => "dead_letter_failed",
            Disposition::Dropped => "dropped",
            Disposition::MetadataUnreadable => "metadata_unreadable",
        }
    }
}

pub struct DurableConsumer<H> {
    subscription: Box<dyn PullSubscription>,
    bus: Arc<dyn EventBus>,
    handler: H,
    config: DurableConsumerConfig,
    metrics: Metrics,
}

impl<H: MessageHandler> DurableConsumer<H> {
    pub fn new(
        subscription: Box<dyn PullSubscription>,
        bus: Arc<dyn EventBus>,
        handler: H,
        config: DurableConsumerConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            subscription,
            bus,
            handler,
            config,
            metrics,
        }
    }

    /// Apply the handler to one delivery and settle it with the bus.
    ///
    /// Errors are settlement failures only (ack/nak could not reach the bus);
    /// the bus will redeliver after its ack wait.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<Disposition, BusError> {
        let disposition = match self
            .handler
            .handle(&delivery.subject, &delivery.payload)
            .await
        {
            Ok(()) => {
                delivery.ack().await?;
                Disposition::Acknowledged
            }
            Err(handler_err) => self.settle_failure(delivery, &handler_err).await?,
        };

        self.metrics
            .consumer_messages_total
            .with_label_values(&[disposition.as_str()])
            .inc();
        Ok(disposition)
    }

    async fn settle_failure(
        &self,
        delivery: &Delivery,
        handler_err: &HandlerError,
    ) -> Result<Disposition, BusError> {
        let metadata = match delivery.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                // Not a processing failure: leave the backoff schedule alone
                warn!(
                    subject = %delivery.subject,
                    error = %e,
                    handler_error = %handler_err,
                    "Delivery metadata unreadable, redelivering"
                );
                delivery.nak(None).await?;
                return Ok(Disposition::MetadataUnreadable);
            }
        };

        if metadata.delivered >= self.config.max_deliver {
            return self.dead_letter(delivery, metadata, handler_err).await;
        }

        let delay = backoff_for_attempt(&self.config.backoff, metadata.delivered);
        warn!(
            subject = %delivery.subject,
            delivered = metadata.delivered,
            stream_sequence = metadata.stream_sequence,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            error = %handler_err,
            "Handler failed, scheduling redelivery"
        );
        delivery.nak(delay).await?;
        Ok(Disposition::Redelivered { delay })
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        metadata: DeliveryMetadata,
        handler_err: &HandlerError,
    ) -> Result<Disposition, BusError> {
        let Some(dlq_subject) = self.config.dlq_subject.as_deref() else {
            warn!(
                subject = %delivery.subject,
                delivered = metadata.delivered,
                stream_sequence = metadata.stream_sequence,
                error = %handler_err,
                "Redelivery exhausted and no DLQ configured, dropping message"
            );
            delivery.ack().await?;
            return Ok(Disposition::Dropped);
        };

        match dlq::forward(self.bus.as_ref(), dlq_subject, delivery, metadata).await {
            Ok(()) => {
                error!(
                    subject = %delivery.subject,
                    dlq_subject = %dlq_subject,
                    delivered = metadata.delivered,
                    stream_sequence = metadata.stream_sequence,
                    error = %handler_err,
                    "Redelivery exhausted, message dead-lettered"
                );
                delivery.ack().await?;
                Ok(Disposition::DeadLettered)
            }
            Err(e) => {
                error!(
                    subject = %delivery.subject,
                    dlq_subject = %dlq_subject,
                    stream_sequence = metadata.stream_sequence,
                    error = %e,
                    "DLQ publish failed, keeping message in redelivery"
                );
                delivery.nak(None).await?;
                Ok(Disposition::DeadLetterFailed)
            }
        }
    }

    /// Fetch one batch and settle every message in it. Returns the batch size.
    pub async fn poll_once(&self) -> Result<usize, BusError> {
        let batch = self
            .subscription
            .fetch(self.config.fetch_batch, self.config.fetch_wait)
            .await?;

        for delivery in &batch {
            if let Err(e) = self.process_delivery(delivery).await {
                error!(
                    subject = %delivery.subject,
                    error = %e,
                    "Failed to settle message; bus will redeliver after ack wait"
                );
            }
        }
        Ok(batch.len())
    }

    /// Poll until `shutdown` flips. Checked between fetches; a fetch in
    /// progress runs to its bounded wait.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            fetch_batch = self.config.fetch_batch,
            max_deliver = self.config.max_deliver,
            dlq_subject = ?self.config.dlq_subject,
            "Starting durable consumer"
        );

        while !shutdown::is_requested(&shutdown) {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Processed batch"),
                Err(e) => {
                    error!(error = %e, "Fetch failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.fetch_wait) => {}
                        _ = shutdown::requested(&mut shutdown) => break,
                    }
                }
            }
        }

        info!("Durable consumer stopped");
    }
}
