//! User write-side with a reliable event pipeline
//!
//! Commands write the user and a `user.created` outbox row in one transaction
//! (deduplicated by idempotency key). The outbox relay drains rows to NATS
//! JetStream, and a durable pull consumer records each event in the audit log,
//! with backoff redelivery and dead-letter routing on repeated failure.

pub mod config;
pub mod consumer;
pub mod db;
pub mod dlq;
pub mod idempotency;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod repos;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod topology;

pub use consumer::{AuditRecorder, Disposition, DurableConsumer, DurableConsumerConfig, HandlerError, MessageHandler};
pub use idempotency::{request_hash, CommandError, CommandOutcome, IdempotentCommandHandler};
pub use relay::{OutboxRelay, OutboxRelayConfig, RelayTick, SubjectRouter};
pub use services::user_service::{CreateUser, UserService};

/// Install the JSON tracing subscriber used by the binaries.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,users_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
