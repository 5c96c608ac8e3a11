//! Outbox relay
//!
//! Each tick leases a batch of pending outbox rows, publishes them with the
//! aggregate id as dedup key, and marks every row processed or failed. Many
//! relays may run against the same table; the claim step keeps their batches
//! disjoint.

use crate::metrics::Metrics;
use crate::models::{ClaimParams, OutboxEvent, USER_CREATED_EVENT};
use crate::shutdown;
use crate::store::{OutboxStore, StoreError};
use event_bus::EventBus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRelayConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub max_attempts: i32,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(2),
            lease_timeout: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl OutboxRelayConfig {
    fn claim_params(&self) -> ClaimParams {
        ClaimParams {
            batch_size: self.batch_size,
            lease_timeout: self.lease_timeout,
            max_attempts: self.max_attempts,
        }
    }
}

/// Maps an event type to the subject it is published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRouter {
    overrides: BTreeMap<String, String>,
}

impl SubjectRouter {
    pub fn new(user_created_subject: impl Into<String>) -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(USER_CREATED_EVENT.to_string(), user_created_subject.into());
        Self { overrides }
    }

    pub fn with_override(mut self, event_type: impl Into<String>, subject: impl Into<String>) -> Self {
        self.overrides.insert(event_type.into(), subject.into());
        self
    }

    /// Override for `event_type` if one exists, otherwise the event type itself.
    pub fn subject_for<'a>(&'a self, event_type: &'a str) -> &'a str {
        self.overrides
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(event_type)
    }

    /// Every subject reachable through an override, deduplicated.
    pub fn routed_subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.overrides.values().cloned().collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }
}

/// Summary of one relay tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTick {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxRelay<S> {
    store: S,
    bus: Arc<dyn EventBus>,
    router: SubjectRouter,
    config: OutboxRelayConfig,
    metrics: Metrics,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(
        store: S,
        bus: Arc<dyn EventBus>,
        router: SubjectRouter,
        config: OutboxRelayConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            bus,
            router,
            config,
            metrics,
        }
    }

    /// Claim one batch and settle every row in it.
    ///
    /// Only a failed claim is returned as an error; per-row publish and
    /// marking failures are recorded and logged.
    pub async fn run_once(&self) -> Result<RelayTick, StoreError> {
        let events = self.store.claim_batch(&self.config.claim_params()).await?;
        let mut tick = RelayTick {
            claimed: events.len(),
            ..Default::default()
        };
        self.metrics.outbox_claimed_total.inc_by(events.len() as u64);

        for event in &events {
            if self.relay_event(event).await {
                tick.published += 1;
            } else {
                tick.failed += 1;
            }
        }

        Ok(tick)
    }

    async fn relay_event(&self, event: &OutboxEvent) -> bool {
        let subject = self.router.subject_for(&event.event_type);
        let Some(leased_at) = event.leased_at else {
            error!(event_id = %event.id, "Claimed outbox event carries no lease, skipping");
            return false;
        };
        let dedup_key = Some(event.aggregate_id.as_str()).filter(|k| !k.is_empty());

        match self
            .bus
            .publish(subject, event.payload.clone(), dedup_key)
            .await
        {
            Ok(()) => {
                self.metrics.outbox_published_total.inc();
                match self.store.mark_processed(event.id, leased_at).await {
                    Ok(true) => debug!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        subject = %subject,
                        "Outbox event published"
                    ),
                    // The new holder publishes again; the dedup key absorbs it
                    Ok(false) => self.lease_lost(event, subject),
                    Err(e) => error!(
                        event_id = %event.id,
                        subject = %subject,
                        error = %e,
                        "Published outbox event but failed to mark it processed"
                    ),
                }
                true
            }
            Err(e) => {
                self.metrics.outbox_publish_failures_total.inc();
                let message = e.to_string();
                if event.attempts >= self.config.max_attempts {
                    error!(
                        event_id = %event.id,
                        subject = %subject,
                        attempts = event.attempts,
                        error = %message,
                        "Outbox event exhausted its attempts and will not be claimed again"
                    );
                } else {
                    warn!(
                        event_id = %event.id,
                        subject = %subject,
                        attempts = event.attempts,
                        error = %message,
                        "Failed to publish outbox event"
                    );
                }
                match self.store.mark_failed(event.id, leased_at, &message).await {
                    Ok(true) => {}
                    Ok(false) => self.lease_lost(event, subject),
                    Err(mark_err) => error!(
                        event_id = %event.id,
                        error = %mark_err,
                        "Failed to record outbox publish failure"
                    ),
                }
                false
            }
        }
    }

    fn lease_lost(&self, event: &OutboxEvent, subject: &str) {
        self.metrics.outbox_lease_lost_total.inc();
        warn!(
            event_id = %event.id,
            subject = %subject,
            attempts = event.attempts,
            "Outbox lease expired and was taken over before the row was settled"
        );
    }

    /// Tick until `shutdown` flips. A tick in progress always finishes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting outbox relay"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown::requested(&mut shutdown) => break,
            }
            if shutdown::is_requested(&shutdown) {
                break;
            }
            tick_count += 1;

            match self.run_once().await {
                Ok(tick) if tick.claimed > 0 => {
                    info!(
                        tick = tick_count,
                        claimed = tick.claimed,
                        published = tick.published,
                        failed = tick.failed,
                        "Relay tick"
                    );
                }
                Ok(_) => {
                    if tick_count <= 3 || tick_count % 60 == 0 {
                        debug!(tick = tick_count, "Relay tick: no pending events");
                    }
                }
                Err(e) => {
                    error!(tick = tick_count, error = %e, "Relay tick failed to claim events");
                }
            }
        }

        info!("Outbox relay stopped");
    }
}
