//! # EventBus Abstraction
//!
//! Messaging primitives for the transactional outbox pipeline: publishing with
//! a deduplication key, pulling batches from a durable subscription, and
//! reconciling the stream/consumer topology those subscriptions live on.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation with durable-consumer semantics
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, NatsBus, PullSubscription};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus = NatsBus::new(nats_client);
//!
//! // Publish with a dedup key (JetStream drops repeats inside its window)
//! bus.publish("user.created", br#"{"id":"42"}"#.to_vec(), Some("42")).await?;
//!
//! // Pull from a durable consumer
//! let subscription = bus.pull_subscription("events", "user-created-worker").await?;
//! for delivery in subscription.fetch(50, Duration::from_secs(2)).await? {
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod inmemory_bus;
mod nats_bus;
pub mod topology;

pub use backoff::backoff_for_attempt;
pub use inmemory_bus::{AckOutcome, AckRecord, InMemoryBus, InMemorySubscription, PublishedMessage};
pub use nats_bus::{NatsBus, NatsPullSubscription};
pub use topology::{ensure_consumer, ensure_stream, ConsumerSpec, Reconciled, StreamSpec, TopologyAdmin};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to fetch messages: {0}")]
    FetchError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("delivery metadata unavailable: {0}")]
    MetadataError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("topology error: {0}")]
    TopologyError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Publishing side of the bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject and wait for the bus to accept it.
    ///
    /// # Arguments
    /// * `subject` - The subject to publish to (e.g., "user.created")
    /// * `payload` - The message payload as raw bytes
    /// * `dedup_key` - Message id the bus uses to discard repeats inside its
    ///   duplicate window
    async fn publish(&self, subject: &str, payload: Vec<u8>, dedup_key: Option<&str>)
        -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Per-message bookkeeping owned by the bus.
///
/// `delivered` is the cumulative delivery count (1 on first delivery) and is
/// never recomputed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub delivered: u64,
    pub stream_sequence: u64,
}

/// Settles a single delivery with the bus.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    /// Negative acknowledgement. `None` leaves redelivery timing to the bus.
    async fn nak(&self, delay: Option<Duration>) -> BusResult<()>;
}

/// A message pulled from a durable subscription.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    metadata: Result<DeliveryMetadata, String>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        subject: String,
        payload: Vec<u8>,
        metadata: Result<DeliveryMetadata, String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject,
            payload,
            metadata,
            acker,
        }
    }

    /// Delivery count and stream sequence, or why they could not be read.
    pub fn metadata(&self) -> BusResult<DeliveryMetadata> {
        self.metadata
            .clone()
            .map_err(BusError::MetadataError)
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.acker.nak(delay).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Pull side of a durable consumer.
#[async_trait]
pub trait PullSubscription: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `max_wait` for the batch.
    /// An empty batch is not an error.
    async fn fetch(&self, max_messages: usize, max_wait: Duration) -> BusResult<Vec<Delivery>>;
}
