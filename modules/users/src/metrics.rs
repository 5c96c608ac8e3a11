use crate::shutdown;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Pipeline counters in a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub outbox_claimed_total: IntCounter,
    pub outbox_published_total: IntCounter,
    pub outbox_publish_failures_total: IntCounter,
    pub outbox_lease_lost_total: IntCounter,
    pub consumer_messages_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let outbox_claimed_total = IntCounter::with_opts(Opts::new(
            "outbox_claimed_total",
            "Outbox events leased by the relay",
        ))?;
        let outbox_published_total = IntCounter::with_opts(Opts::new(
            "outbox_published_total",
            "Outbox events published to the bus",
        ))?;
        let outbox_publish_failures_total = IntCounter::with_opts(Opts::new(
            "outbox_publish_failures_total",
            "Outbox publish attempts that failed",
        ))?;
        let outbox_lease_lost_total = IntCounter::with_opts(Opts::new(
            "outbox_lease_lost_total",
            "Outbox rows whose lease was taken over before the relay settled them",
        ))?;
        let consumer_messages_total = IntCounterVec::new(
            Opts::new("consumer_messages_total", "Messages settled by the durable consumer"),
            &["outcome"], // ack|nak|dead_lettered|dead_letter_failed|dropped|metadata_unreadable
        )?;

        registry.register(Box::new(outbox_claimed_total.clone()))?;
        registry.register(Box::new(outbox_published_total.clone()))?;
        registry.register(Box::new(outbox_publish_failures_total.clone()))?;
        registry.register(Box::new(outbox_lease_lost_total.clone()))?;
        registry.register(Box::new(consumer_messages_total.clone()))?;

        Ok(Self {
            registry,
            outbox_claimed_total,
            outbox_published_total,
            outbox_publish_failures_total,
            outbox_lease_lost_total,
            consumer_messages_total,
        })
    }

    pub fn consumer_outcome(&self, outcome: &str) -> u64 {
        self.consumer_messages_total
            .with_label_values(&[outcome])
            .get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Log a snapshot every `every` until `shutdown` flips. Returns the number
    /// of snapshots written.
    ///
    /// There is no scrape endpoint in these processes; the snapshot log is how
    /// the counters reach an operator.
    pub async fn log_periodically(&self, every: Duration, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        let mut snapshots = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown::requested(&mut shutdown) => break,
            }
            match self.render() {
                Ok(text) => {
                    snapshots += 1;
                    info!(metrics = %text, "Metrics snapshot");
                }
                Err(e) => warn!(error = %e, "Failed to render metrics"),
            }
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.outbox_published_total.inc();
        metrics
            .consumer_messages_total
            .with_label_values(&["ack"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("outbox_published_total 1"));
        assert!(text.contains("consumer_messages_total{outcome=\"ack\"} 1"));
        assert_eq!(metrics.consumer_outcome("ack"), 1);
        assert_eq!(metrics.consumer_outcome("nak"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_logged_until_shutdown() {
        let metrics = Metrics::new().unwrap();
        let (tx, rx) = shutdown::channel();
        let handle = tokio::spawn({
            let metrics = metrics.clone();
            async move { metrics.log_periodically(Duration::from_secs(10), rx).await }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 3);
    }
}
