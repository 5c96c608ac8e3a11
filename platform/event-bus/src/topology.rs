//! Stream and durable-consumer reconciliation
//!
//! Makes the bus topology match declared intent on every process start.
//! Streams get their subject list updated in place. Durable consumers are never
//! mutated in place: a consumer whose redelivery limit or backoff schedule has
//! drifted is deleted and created again.

use crate::{BusError, BusResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Declared configuration of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    /// Window inside which repeated message ids are discarded
    pub duplicate_window: Duration,
}

/// Declared configuration of a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
    /// Redelivery limit; `-1` means unlimited
    pub max_deliver: i64,
    pub backoff: Vec<Duration>,
}

impl ConsumerSpec {
    /// Whether an existing consumer must be recreated to match `self`.
    ///
    /// Only the redelivery limit and the backoff schedule are compared, the
    /// schedule element by element.
    pub fn requires_recreate(&self, current: &ConsumerSpec) -> bool {
        self.max_deliver != current.max_deliver || self.backoff != current.backoff
    }

    fn validate(&self) -> BusResult<()> {
        if self.durable.trim().is_empty() {
            return Err(BusError::InvalidConfig("consumer durable name is required".into()));
        }
        if self.filter_subject.trim().is_empty() {
            return Err(BusError::InvalidConfig("consumer filter subject is required".into()));
        }
        Ok(())
    }
}

/// What a reconcile call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created,
    Updated,
    Recreated,
    Unchanged,
}

/// Administrative operations on the bus topology.
#[async_trait]
pub trait TopologyAdmin: Send + Sync {
    /// Subjects captured by `stream`, or `None` when it does not exist.
    async fn stream_subjects(&self, stream: &str) -> BusResult<Option<Vec<String>>>;

    async fn create_stream(&self, spec: &StreamSpec) -> BusResult<()>;

    async fn update_stream_subjects(&self, stream: &str, subjects: &[String]) -> BusResult<()>;

    /// Current configuration of `durable`, or `None` when it does not exist.
    async fn consumer_spec(&self, stream: &str, durable: &str) -> BusResult<Option<ConsumerSpec>>;

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<()>;

    async fn delete_consumer(&self, stream: &str, durable: &str) -> BusResult<()>;
}

/// Create `spec.name` if missing, otherwise bring its subject list in line.
pub async fn ensure_stream<A>(admin: &A, spec: &StreamSpec) -> BusResult<Reconciled>
where
    A: TopologyAdmin + ?Sized,
{
    if spec.name.trim().is_empty() {
        return Err(BusError::InvalidConfig("stream name is required".into()));
    }
    if spec.subjects.is_empty() {
        return Err(BusError::InvalidConfig(format!(
            "stream {} needs at least one subject",
            spec.name
        )));
    }

    match admin.stream_subjects(&spec.name).await? {
        None => {
            admin.create_stream(spec).await?;
            info!(stream = %spec.name, subjects = ?spec.subjects, "Stream created");
            Ok(Reconciled::Created)
        }
        Some(current) if same_subjects(&current, &spec.subjects) => Ok(Reconciled::Unchanged),
        Some(current) => {
            admin
                .update_stream_subjects(&spec.name, &spec.subjects)
                .await?;
            info!(
                stream = %spec.name,
                previous = ?current,
                subjects = ?spec.subjects,
                "Stream subjects updated"
            );
            Ok(Reconciled::Updated)
        }
    }
}

/// Make the durable consumer on `stream` match `spec`. Safe to call on every start.
pub async fn ensure_consumer<A>(admin: &A, stream: &str, spec: &ConsumerSpec) -> BusResult<Reconciled>
where
    A: TopologyAdmin + ?Sized,
{
    spec.validate()?;

    match admin.consumer_spec(stream, &spec.durable).await? {
        None => {
            admin.create_consumer(stream, spec).await?;
            info!(stream = %stream, durable = %spec.durable, "Consumer created");
            Ok(Reconciled::Created)
        }
        Some(current) if spec.requires_recreate(&current) => {
            warn!(
                stream = %stream,
                durable = %spec.durable,
                current_max_deliver = current.max_deliver,
                desired_max_deliver = spec.max_deliver,
                current_backoff = ?current.backoff,
                desired_backoff = ?spec.backoff,
                "Consumer redelivery policy drifted, recreating"
            );
            admin.delete_consumer(stream, &spec.durable).await?;
            admin.create_consumer(stream, spec).await?;
            Ok(Reconciled::Recreated)
        }
        Some(_) => Ok(Reconciled::Unchanged),
    }
}

/// Multiset equality of two subject lists (order-insensitive, duplicates counted).
fn same_subjects(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut seen: HashMap<&str, i32> = HashMap::with_capacity(a.len());
    for s in a {
        *seen.entry(s.as_str()).or_default() += 1;
    }
    for s in b {
        match seen.get_mut(s.as_str()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => return false,
        }
    }
    seen.values().all(|count| *count == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;

    fn consumer(max_deliver: i64, backoff: &[u64]) -> ConsumerSpec {
        ConsumerSpec {
            durable: "user-created-worker".to_string(),
            filter_subject: "user.created".to_string(),
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 256,
            max_deliver,
            backoff: backoff.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    fn stream(subjects: &[&str]) -> StreamSpec {
        StreamSpec {
            name: "events".to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            duplicate_window: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_same_subjects_ignores_order() {
        let a = vec!["a".to_string(), "b".to_string()];
        let b = vec!["b".to_string(), "a".to_string()];
        assert!(same_subjects(&a, &b));
    }

    #[test]
    fn test_same_subjects_counts_duplicates() {
        let a = vec!["a".to_string(), "a".to_string()];
        let b = vec!["a".to_string(), "b".to_string()];
        assert!(!same_subjects(&a, &b));
        assert!(!same_subjects(&a, &a[..1]));
    }

    #[test]
    fn test_backoff_compared_element_wise() {
        let desired = consumer(10, &[1, 5, 30]);
        assert!(!desired.requires_recreate(&consumer(10, &[1, 5, 30])));
        // Same length, different values
        assert!(desired.requires_recreate(&consumer(10, &[1, 5, 60])));
        assert!(desired.requires_recreate(&consumer(10, &[1, 5])));
        assert!(desired.requires_recreate(&consumer(5, &[1, 5, 30])));
    }

    #[test]
    fn test_ack_wait_drift_does_not_recreate() {
        let desired = consumer(10, &[1]);
        let mut current = desired.clone();
        current.ack_wait = Duration::from_secs(5);
        assert!(!desired.requires_recreate(&current));
    }

    #[tokio::test]
    async fn test_ensure_stream_creates_then_is_idempotent() {
        let bus = InMemoryBus::new();
        let spec = stream(&["user.created", "user.created.dlq"]);

        assert_eq!(ensure_stream(&bus, &spec).await.unwrap(), Reconciled::Created);
        assert_eq!(ensure_stream(&bus, &spec).await.unwrap(), Reconciled::Unchanged);

        let reordered = stream(&["user.created.dlq", "user.created"]);
        assert_eq!(ensure_stream(&bus, &reordered).await.unwrap(), Reconciled::Unchanged);
    }

    #[tokio::test]
    async fn test_ensure_stream_updates_subjects() {
        let bus = InMemoryBus::new();
        ensure_stream(&bus, &stream(&["user.created"])).await.unwrap();

        let widened = stream(&["user.created", "user.created.dlq"]);
        assert_eq!(ensure_stream(&bus, &widened).await.unwrap(), Reconciled::Updated);
        let subjects = bus.stream_subjects("events").await.unwrap().unwrap();
        assert_eq!(subjects.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_consumer_lifecycle() {
        let bus = InMemoryBus::new();
        ensure_stream(&bus, &stream(&["user.created"])).await.unwrap();

        let spec = consumer(10, &[1, 5]);
        assert_eq!(ensure_consumer(&bus, "events", &spec).await.unwrap(), Reconciled::Created);
        assert_eq!(ensure_consumer(&bus, "events", &spec).await.unwrap(), Reconciled::Unchanged);

        let changed = consumer(10, &[1, 10]);
        assert_eq!(
            ensure_consumer(&bus, "events", &changed).await.unwrap(),
            Reconciled::Recreated
        );
        let current = bus
            .consumer_spec("events", "user-created-worker")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.backoff, changed.backoff);
    }

    #[tokio::test]
    async fn test_ensure_consumer_rejects_missing_names() {
        let bus = InMemoryBus::new();
        let mut spec = consumer(10, &[]);
        spec.durable = String::new();
        assert!(matches!(
            ensure_consumer(&bus, "events", &spec).await,
            Err(BusError::InvalidConfig(_))
        ));
    }
}
