//! In-memory implementation of the bus traits for testing and development
//!
//! Models the JetStream behaviour the outbox pipeline depends on: streams that
//! capture subjects, message-id deduplication inside a window, and durable pull
//! consumers with explicit acks, ack-wait redelivery, delayed naks and a
//! redelivery cap.

use crate::{
    Acknowledger, BusError, BusResult, ConsumerSpec, Delivery, DeliveryMetadata, EventBus,
    PullSubscription, StreamSpec, TopologyAdmin,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// A publish the bus accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
    /// Stream sequence assigned, `None` when discarded as a duplicate
    pub sequence: Option<u64>,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nak(Option<Duration>),
}

/// One settlement call, in the order the bus received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub stream_sequence: u64,
    pub delivered: u64,
    pub outcome: AckOutcome,
}

/// EventBus implementation held entirely in memory
///
/// Suitable for unit tests and integration tests that need durable-consumer
/// semantics without a NATS server. Cloning shares the same bus.
///
/// # Example
/// ```rust
/// use event_bus::{ensure_stream, EventBus, InMemoryBus, StreamSpec};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// ensure_stream(&bus, &StreamSpec {
///     name: "events".into(),
///     subjects: vec!["user.created".into()],
///     duplicate_window: Duration::from_secs(120),
/// }).await?;
///
/// bus.publish("user.created", b"hello".to_vec(), Some("u-1")).await?;
/// bus.publish("user.created", b"hello".to_vec(), Some("u-1")).await?;
/// assert_eq!(bus.stream_len("events").await, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    streams: Vec<MemStream>,
    published: Vec<PublishedMessage>,
    acks: Vec<AckRecord>,
    failing_subjects: Vec<String>,
    fail_fetches: bool,
}

struct MemStream {
    spec: StreamSpec,
    messages: Vec<StoredMessage>,
    msg_ids: HashMap<String, Instant>,
    consumers: HashMap<String, MemConsumer>,
}

struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
}

struct MemConsumer {
    spec: ConsumerSpec,
    /// Highest stream sequence handed to this consumer at least once
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    delivered: u64,
    available_at: Instant,
    in_flight_since: Option<Instant>,
}

impl MemConsumer {
    fn new(spec: ConsumerSpec) -> Self {
        Self {
            spec,
            cursor: 0,
            pending: BTreeMap::new(),
        }
    }

    fn exhausted(&self, delivered: u64) -> bool {
        self.spec.max_deliver > 0 && delivered >= self.spec.max_deliver as u64
    }

    fn ack_wait_elapsed(&self, since: Instant, now: Instant) -> bool {
        now.duration_since(since) >= self.spec.ack_wait
    }

    /// Earliest instant something becomes deliverable again.
    fn next_wake(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| match p.in_flight_since {
                Some(since) => since + self.spec.ack_wait,
                None => p.available_at,
            })
            .min()
    }
}

impl MemStream {
    fn captures(&self, subject: &str) -> bool {
        self.spec
            .subjects
            .iter()
            .any(|pattern| InMemoryBus::matches_pattern(subject, pattern))
    }

    fn is_duplicate(&mut self, msg_id: &str, now: Instant) -> bool {
        let window = self.spec.duplicate_window;
        self.msg_ids
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        self.msg_ids.contains_key(msg_id)
    }

    fn pull(&mut self, durable: &str, max_messages: usize, now: Instant) -> Vec<(u64, u64, String, Vec<u8>)> {
        let Some(consumer) = self.consumers.get_mut(durable) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        // Redeliveries: nak'd and due, or in flight past ack wait
        let mut exhausted = Vec::new();
        for (seq, pending) in consumer.pending.iter() {
            if out.len() >= max_messages {
                break;
            }
            let due = match pending.in_flight_since {
                Some(since) => consumer.ack_wait_elapsed(since, now),
                None => pending.available_at <= now,
            };
            if !due {
                continue;
            }
            if consumer.exhausted(pending.delivered) {
                exhausted.push(*seq);
                continue;
            }
            out.push(*seq);
        }
        for seq in exhausted {
            consumer.pending.remove(&seq);
        }

        // New messages past the cursor, bounded by max_ack_pending
        let max_pending = usize::try_from(consumer.spec.max_ack_pending)
            .ok()
            .filter(|m| *m > 0)
            .unwrap_or(usize::MAX);
        let start_cursor = consumer.cursor;
        for message in self.messages.iter().filter(|m| m.sequence > start_cursor) {
            if out.len() >= max_messages || consumer.pending.len() >= max_pending {
                break;
            }
            consumer.cursor = message.sequence;
            if !InMemoryBus::matches_pattern(&message.subject, &consumer.spec.filter_subject) {
                continue;
            }
            consumer.pending.insert(
                message.sequence,
                Pending {
                    delivered: 0,
                    available_at: now,
                    in_flight_since: None,
                },
            );
            out.push(message.sequence);
        }

        let mut batch = Vec::with_capacity(out.len());
        for seq in out {
            let Some(pending) = consumer.pending.get_mut(&seq) else {
                continue;
            };
            pending.delivered += 1;
            pending.in_flight_since = Some(now);
            let delivered = pending.delivered;
            if let Some(message) = self.messages.iter().find(|m| m.sequence == seq) {
                batch.push((seq, delivered, message.subject.clone(), message.payload.clone()));
            }
        }
        batch
    }
}

impl InMemoryBus {
    /// Create a new, empty in-memory bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    pub(crate) fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            match pattern_tokens[p_idx] {
                ">" => return true,
                "*" => {}
                token if token == subject_tokens[s_idx] => {}
                _ => return false,
            }
            s_idx += 1;
            p_idx += 1;
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    /// Durable pull subscription handle for `durable` on `stream`.
    pub fn subscription(&self, stream: &str, durable: &str) -> InMemorySubscription {
        InMemorySubscription {
            shared: Arc::clone(&self.shared),
            stream: stream.to_string(),
            durable: durable.to_string(),
        }
    }

    /// Every publish the bus accepted, duplicates included.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().await.published.clone()
    }

    /// Accepted publishes on one subject.
    pub async fn published_to(&self, subject: &str) -> Vec<PublishedMessage> {
        self.shared
            .state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Number of messages stored in `stream`.
    pub async fn stream_len(&self, stream: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .streams
            .iter()
            .find(|s| s.spec.name == stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Settlement calls in arrival order.
    pub async fn acknowledgements(&self) -> Vec<AckRecord> {
        self.shared.state.lock().await.acks.clone()
    }

    /// Unacknowledged deliveries held by a consumer.
    pub async fn pending_count(&self, stream: &str, durable: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .streams
            .iter()
            .find(|s| s.spec.name == stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// Make publishes to subjects matching `pattern` fail until cleared.
    pub async fn fail_subject(&self, pattern: &str) {
        self.shared
            .state
            .lock()
            .await
            .failing_subjects
            .push(pattern.to_string());
    }

    /// Make every fetch fail until cleared.
    pub async fn fail_fetches(&self) {
        self.shared.state.lock().await.fail_fetches = true;
    }

    pub async fn clear_failures(&self) {
        let mut state = self.shared.state.lock().await;
        state.failing_subjects.clear();
        state.fail_fetches = false;
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
    ) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        if state
            .failing_subjects
            .iter()
            .any(|p| Self::matches_pattern(subject, p))
        {
            return Err(BusError::PublishError(format!(
                "injected failure for subject {}",
                subject
            )));
        }

        let now = Instant::now();
        let dedup_key = dedup_key.filter(|k| !k.is_empty());
        let stream = state
            .streams
            .iter_mut()
            .find(|s| s.captures(subject))
            .ok_or_else(|| {
                BusError::PublishError(format!("no stream captures subject {}", subject))
            })?;

        let sequence = match dedup_key {
            Some(key) if stream.is_duplicate(key, now) => None,
            _ => {
                let sequence = stream.messages.len() as u64 + 1;
                stream.messages.push(StoredMessage {
                    sequence,
                    subject: subject.to_string(),
                    payload: payload.clone(),
                });
                if let Some(key) = dedup_key {
                    stream.msg_ids.insert(key.to_string(), now);
                }
                Some(sequence)
            }
        };

        state.published.push(PublishedMessage {
            subject: subject.to_string(),
            payload,
            dedup_key: dedup_key.map(str::to_string),
            sequence,
        });
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TopologyAdmin for InMemoryBus {
    async fn stream_subjects(&self, stream: &str) -> BusResult<Option<Vec<String>>> {
        let state = self.shared.state.lock().await;
        Ok(state
            .streams
            .iter()
            .find(|s| s.spec.name == stream)
            .map(|s| s.spec.subjects.clone()))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.streams.iter().any(|s| s.spec.name == spec.name) {
            return Err(BusError::TopologyError(format!(
                "stream {} already exists",
                spec.name
            )));
        }
        state.streams.push(MemStream {
            spec: spec.clone(),
            messages: Vec::new(),
            msg_ids: HashMap::new(),
            consumers: HashMap::new(),
        });
        Ok(())
    }

    async fn update_stream_subjects(&self, stream: &str, subjects: &[String]) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        let target = find_stream(&mut state, stream)?;
        target.spec.subjects = subjects.to_vec();
        Ok(())
    }

    async fn consumer_spec(&self, stream: &str, durable: &str) -> BusResult<Option<ConsumerSpec>> {
        let mut state = self.shared.state.lock().await;
        let target = find_stream(&mut state, stream)?;
        Ok(target.consumers.get(durable).map(|c| c.spec.clone()))
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        let target = find_stream(&mut state, stream)?;
        if target.consumers.contains_key(&spec.durable) {
            return Err(BusError::TopologyError(format!(
                "consumer {} already exists",
                spec.durable
            )));
        }
        target
            .consumers
            .insert(spec.durable.clone(), MemConsumer::new(spec.clone()));
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        let target = find_stream(&mut state, stream)?;
        target
            .consumers
            .remove(durable)
            .map(|_| ())
            .ok_or_else(|| BusError::TopologyError(format!("consumer {} not found", durable)))
    }
}

fn find_stream<'a>(state: &'a mut State, name: &str) -> BusResult<&'a mut MemStream> {
    state
        .streams
        .iter_mut()
        .find(|s| s.spec.name == name)
        .ok_or_else(|| BusError::TopologyError(format!("stream {} not found", name)))
}

/// Pull handle returned by [`InMemoryBus::subscription`].
pub struct InMemorySubscription {
    shared: Arc<Shared>,
    stream: String,
    durable: String,
}

#[async_trait]
impl PullSubscription for InMemorySubscription {
    async fn fetch(&self, max_messages: usize, max_wait: Duration) -> BusResult<Vec<Delivery>> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Registered before inspecting state so a publish in between still wakes us
            let notified = self.shared.notify.notified();

            let next_wake = {
                let mut state = self.shared.state.lock().await;
                if state.fail_fetches {
                    return Err(BusError::FetchError("injected fetch failure".to_string()));
                }
                let stream = find_stream(&mut state, &self.stream)
                    .map_err(|e| BusError::FetchError(e.to_string()))?;
                if !stream.consumers.contains_key(&self.durable) {
                    return Err(BusError::FetchError(format!(
                        "consumer {} not found",
                        self.durable
                    )));
                }

                let batch = stream.pull(&self.durable, max_messages, Instant::now());
                if !batch.is_empty() {
                    return Ok(batch
                        .into_iter()
                        .map(|(sequence, delivered, subject, payload)| {
                            Delivery::new(
                                subject,
                                payload,
                                Ok(DeliveryMetadata {
                                    delivered,
                                    stream_sequence: sequence,
                                }),
                                Box::new(InMemoryAcker {
                                    shared: Arc::clone(&self.shared),
                                    stream: self.stream.clone(),
                                    durable: self.durable.clone(),
                                    sequence,
                                    delivered,
                                }),
                            )
                        })
                        .collect());
                }
                stream
                    .consumers
                    .get(&self.durable)
                    .and_then(MemConsumer::next_wake)
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_wake.map_or(deadline, |w| w.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    stream: String,
    durable: String,
    sequence: u64,
    delivered: u64,
}

impl InMemoryAcker {
    async fn settle(&self, outcome: AckOutcome) -> BusResult<()> {
        let mut state = self.shared.state.lock().await;
        state.acks.push(AckRecord {
            stream_sequence: self.sequence,
            delivered: self.delivered,
            outcome,
        });

        let stream = find_stream(&mut state, &self.stream)
            .map_err(|e| BusError::AckError(e.to_string()))?;
        if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
            let exhausted = consumer.exhausted(self.delivered);
            match outcome {
                AckOutcome::Ack => {
                    consumer.pending.remove(&self.sequence);
                }
                AckOutcome::Nak(_) if exhausted => {
                    consumer.pending.remove(&self.sequence);
                }
                AckOutcome::Nak(delay) => {
                    if let Some(pending) = consumer.pending.get_mut(&self.sequence) {
                        pending.in_flight_since = None;
                        pending.available_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
                    }
                }
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(AckOutcome::Ack).await
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.settle(AckOutcome::Nak(delay)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure_consumer, ensure_stream};

    async fn bus_with_consumer(max_deliver: i64, ack_wait: Duration) -> InMemoryBus {
        let bus = InMemoryBus::new();
        ensure_stream(
            &bus,
            &StreamSpec {
                name: "events".to_string(),
                subjects: vec!["user.created".to_string(), "user.created.dlq".to_string()],
                duplicate_window: Duration::from_secs(120),
            },
        )
        .await
        .unwrap();
        ensure_consumer(
            &bus,
            "events",
            &ConsumerSpec {
                durable: "worker".to_string(),
                filter_subject: "user.created".to_string(),
                ack_wait,
                max_ack_pending: 256,
                max_deliver,
                backoff: vec![],
            },
        )
        .await
        .unwrap();
        bus
    }

    #[test]
    fn test_pattern_matching() {
        // Exact match
        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.events.user.created"));

        // Single wildcard
        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.*.user.created"));
        assert!(!InMemoryBus::matches_pattern("auth.events.user.created", "auth.*.created"));

        // Multi-level wildcard
        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.>"));
        assert!(!InMemoryBus::matches_pattern("auth.events.user.created", "billing.>"));

        // Edge cases
        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
        assert!(!InMemoryBus::matches_pattern("user.created.dlq", "user.created"));
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let bus = InMemoryBus::new();
        let result = bus.publish("nowhere", b"x".to_vec(), None).await;
        assert!(matches!(result, Err(BusError::PublishError(_))));
    }

    #[tokio::test]
    async fn test_duplicate_ids_discarded_inside_window() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        bus.publish("user.created", b"a".to_vec(), Some("k1")).await.unwrap();
        bus.publish("user.created", b"a".to_vec(), Some("k1")).await.unwrap();
        bus.publish("user.created", b"b".to_vec(), Some("k2")).await.unwrap();
        bus.publish("user.created", b"c".to_vec(), None).await.unwrap();

        assert_eq!(bus.stream_len("events").await, 3);
        let published = bus.published().await;
        assert_eq!(published.len(), 4);
        assert_eq!(published[1].sequence, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_window_expires() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        bus.publish("user.created", b"a".to_vec(), Some("k1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(121)).await;
        bus.publish("user.created", b"a".to_vec(), Some("k1")).await.unwrap();
        assert_eq!(bus.stream_len("events").await, 2);
    }

    #[tokio::test]
    async fn test_fetch_filters_and_acks() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        bus.publish("user.created", b"one".to_vec(), None).await.unwrap();
        bus.publish("user.created.dlq", b"dead".to_vec(), None).await.unwrap();

        let sub = bus.subscription("events", "worker");
        let batch = sub.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"one");
        assert_eq!(batch[0].metadata().unwrap().delivered, 1);

        batch[0].ack().await.unwrap();
        assert_eq!(bus.pending_count("events", "worker").await, 0);

        let empty = sub.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_with_delay_redelivers_later() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        bus.publish("user.created", b"one".to_vec(), None).await.unwrap();

        let sub = bus.subscription("events", "worker");
        let first = sub.fetch(1, Duration::from_millis(10)).await.unwrap();
        first[0].nak(Some(Duration::from_secs(5))).await.unwrap();

        let early = sub.fetch(1, Duration::from_secs(1)).await.unwrap();
        assert!(early.is_empty());

        let again = sub.fetch(1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].metadata().unwrap().delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait_expiry_redelivers() {
        let bus = bus_with_consumer(5, Duration::from_secs(2)).await;
        bus.publish("user.created", b"one".to_vec(), None).await.unwrap();

        let sub = bus.subscription("events", "worker");
        let first = sub.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Never settled; comes back once ack wait elapses
        let again = sub.fetch(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].metadata().unwrap().delivered, 2);
    }

    #[tokio::test]
    async fn test_max_deliver_stops_redelivery() {
        let bus = bus_with_consumer(2, Duration::from_secs(30)).await;
        bus.publish("user.created", b"one".to_vec(), None).await.unwrap();

        let sub = bus.subscription("events", "worker");
        for _ in 0..2 {
            let batch = sub.fetch(1, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.len(), 1);
            batch[0].nak(None).await.unwrap();
        }

        let empty = sub.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(bus.pending_count("events", "worker").await, 0);
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        let sub = bus.subscription("events", "worker");

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("user.created", b"late".to_vec(), None)
                .await
                .unwrap();
        });

        let batch = sub.fetch(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_acknowledgements_recorded() {
        let bus = bus_with_consumer(5, Duration::from_secs(30)).await;
        bus.publish("user.created", b"one".to_vec(), None).await.unwrap();
        let sub = bus.subscription("events", "worker");
        let batch = sub.fetch(1, Duration::from_millis(10)).await.unwrap();
        batch[0].nak(Some(Duration::from_millis(1))).await.unwrap();

        let acks = bus.acknowledgements().await;
        assert_eq!(
            acks,
            vec![AckRecord {
                stream_sequence: 1,
                delivered: 1,
                outcome: AckOutcome::Nak(Some(Duration::from_millis(1))),
            }]
        );
    }
}
