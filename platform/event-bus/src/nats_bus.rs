//! NATS JetStream implementation of the bus traits

use crate::{
    Acknowledger, BusError, BusResult, ConsumerSpec, Delivery, DeliveryMetadata, EventBus,
    PullSubscription, StreamSpec, TopologyAdmin,
};
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;

const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Bus implementation backed by a JetStream context
///
/// Publishes wait for the stream's acknowledgement, so a returned `Ok` means
/// the message is persisted (or was discarded as a duplicate of one that is).
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.publish("user.created", b"{}".to_vec(), Some("user-1")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Create a new NatsBus from an already-connected client
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Bind to an existing durable pull consumer on `stream`.
    pub async fn pull_subscription(
        &self,
        stream: &str,
        durable: &str,
    ) -> BusResult<NatsPullSubscription> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::TopologyError(format!("get stream {}: {}", stream, e)))?;
        let consumer = stream
            .get_consumer::<consumer::pull::Config>(durable)
            .await
            .map_err(|e| BusError::TopologyError(format!("get consumer {}: {}", durable, e)))?;

        Ok(NatsPullSubscription { consumer })
    }

    async fn stream_exists(&self, name: &str) -> BusResult<bool> {
        let names: Vec<String> = self
            .jetstream
            .stream_names()
            .try_collect()
            .await
            .map_err(|e| BusError::TopologyError(format!("list streams: {}", e)))?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn get_stream(&self, name: &str) -> BusResult<stream::Stream> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| BusError::TopologyError(format!("get stream {}: {}", name, e)))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
    ) -> BusResult<()> {
        let mut headers = async_nats::HeaderMap::new();
        if let Some(key) = dedup_key.filter(|k| !k.is_empty()) {
            headers.insert(MSG_ID_HEADER, key);
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;
        ack.await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl TopologyAdmin for NatsBus {
    async fn stream_subjects(&self, stream: &str) -> BusResult<Option<Vec<String>>> {
        if !self.stream_exists(stream).await? {
            return Ok(None);
        }
        let stream = self.get_stream(stream).await?;
        Ok(Some(stream.cached_info().config.subjects.clone()))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> BusResult<()> {
        self.jetstream
            .create_stream(stream::Config {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::Limits,
                duplicate_window: spec.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::TopologyError(format!("create stream {}: {}", spec.name, e)))?;
        Ok(())
    }

    async fn update_stream_subjects(&self, stream: &str, subjects: &[String]) -> BusResult<()> {
        let current = self.get_stream(stream).await?;
        let mut config = current.cached_info().config.clone();
        config.subjects = subjects.to_vec();

        self.jetstream
            .update_stream(&config)
            .await
            .map_err(|e| BusError::TopologyError(format!("update stream {}: {}", stream, e)))?;
        Ok(())
    }

    async fn consumer_spec(&self, stream: &str, durable: &str) -> BusResult<Option<ConsumerSpec>> {
        let stream = self.get_stream(stream).await?;
        let names: Vec<String> = stream
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| BusError::TopologyError(format!("list consumers: {}", e)))?;
        if !names.iter().any(|n| n == durable) {
            return Ok(None);
        }

        let info = stream
            .consumer_info(durable)
            .await
            .map_err(|e| BusError::TopologyError(format!("consumer info {}: {}", durable, e)))?;
        let config = info.config;
        Ok(Some(ConsumerSpec {
            durable: durable.to_string(),
            filter_subject: config.filter_subject,
            ack_wait: config.ack_wait,
            max_ack_pending: config.max_ack_pending,
            max_deliver: config.max_deliver,
            backoff: config.backoff,
        }))
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<()> {
        let stream = self.get_stream(stream).await?;
        stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(spec.durable.clone()),
                ack_policy: consumer::AckPolicy::Explicit,
                ack_wait: spec.ack_wait,
                max_ack_pending: spec.max_ack_pending,
                max_deliver: spec.max_deliver,
                filter_subject: spec.filter_subject.clone(),
                backoff: spec.backoff.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BusError::TopologyError(format!("create consumer {}: {}", spec.durable, e))
            })?;
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> BusResult<()> {
        let stream = self.get_stream(stream).await?;
        stream
            .delete_consumer(durable)
            .await
            .map_err(|e| BusError::TopologyError(format!("delete consumer {}: {}", durable, e)))?;
        Ok(())
    }
}

/// Durable pull consumer bound through [`NatsBus::pull_subscription`].
pub struct NatsPullSubscription {
    consumer: consumer::PullConsumer,
}

#[async_trait]
impl PullSubscription for NatsPullSubscription {
    async fn fetch(&self, max_messages: usize, max_wait: Duration) -> BusResult<Vec<Delivery>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| BusError::FetchError(e.to_string()))?;

        let mut deliveries = Vec::with_capacity(max_messages);
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| BusError::FetchError(e.to_string()))?;
            let metadata = message
                .info()
                .map(|info| DeliveryMetadata {
                    delivered: u64::try_from(info.delivered).unwrap_or(0),
                    stream_sequence: info.stream_sequence,
                })
                .map_err(|e| e.to_string());

            deliveries.push(Delivery::new(
                message.subject.to_string(),
                message.payload.to_vec(),
                metadata,
                Box::new(NatsAcker { message }),
            ));
        }

        Ok(deliveries)
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure_consumer, ensure_stream};

    // These tests require a running NATS server with JetStream enabled:
    // docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_and_pull() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");
        let bus = NatsBus::new(client);

        let stream = StreamSpec {
            name: "EVENT_BUS_TEST".to_string(),
            subjects: vec!["bus-test.created".to_string()],
            duplicate_window: Duration::from_secs(120),
        };
        ensure_stream(&bus, &stream).await.unwrap();

        let consumer = ConsumerSpec {
            durable: "bus-test-worker".to_string(),
            filter_subject: "bus-test.created".to_string(),
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 16,
            max_deliver: 3,
            backoff: vec![],
        };
        ensure_consumer(&bus, &stream.name, &consumer).await.unwrap();

        bus.publish("bus-test.created", b"one".to_vec(), Some("bus-test-1"))
            .await
            .unwrap();
        // Duplicate id inside the window is discarded by the server
        bus.publish("bus-test.created", b"one".to_vec(), Some("bus-test-1"))
            .await
            .unwrap();

        let subscription = bus
            .pull_subscription(&stream.name, &consumer.durable)
            .await
            .unwrap();
        let batch = subscription.fetch(10, Duration::from_secs(2)).await.unwrap();
        assert!(!batch.is_empty());
        for delivery in &batch {
            assert_eq!(delivery.payload, b"one");
            assert!(delivery.metadata().unwrap().delivered >= 1);
            delivery.ack().await.unwrap();
        }
    }
}
