use crate::consumer::DurableConsumerConfig;
use crate::relay::{OutboxRelayConfig, SubjectRouter};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Service configuration parsed from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub database_read_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,

    pub nats_url: String,
    pub stream: String,
    pub user_created_subject: String,
    pub dlq_subject: Option<String>,
    pub consumer_durable: String,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
    /// Delivery count at which the consumer dead-letters a failing message
    pub max_deliver: i64,
    pub backoff: Vec<Duration>,
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
    pub duplicate_window: Duration,

    pub outbox_batch_size: i64,
    pub outbox_poll_interval: Duration,
    pub outbox_lease_timeout: Duration,
    pub outbox_max_attempts: i32,
    pub subject_overrides: Vec<(String, String)>,

    /// How often the binaries log a metrics snapshot; zero disables it
    pub metrics_log_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset and empty values take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let nats_url = get("NATS_URL").ok_or(ConfigError::Missing("NATS_URL"))?;

        // Explicitly empty disables dead-lettering
        let dlq_subject = match lookup("NATS_DLQ_SUBJECT") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
            None => Some("user.created.dlq".to_string()),
        };

        let config = Config {
            database_url,
            database_read_url: get("DATABASE_READ_URL"),
            db_max_connections: parse(&get, "DB_MAX_CONNECTIONS", 10)?,
            db_acquire_timeout: Duration::from_secs(parse(&get, "DB_ACQUIRE_TIMEOUT_SECS", 3)?),

            nats_url,
            stream: get("NATS_STREAM").unwrap_or_else(|| "events".to_string()),
            user_created_subject: get("NATS_USER_CREATED_SUBJECT")
                .unwrap_or_else(|| "user.created".to_string()),
            dlq_subject,
            consumer_durable: get("NATS_CONSUMER_DURABLE")
                .unwrap_or_else(|| "user-created-worker".to_string()),
            ack_wait: Duration::from_secs(parse(&get, "NATS_ACK_WAIT_SECS", 30)?),
            max_ack_pending: parse(&get, "NATS_MAX_ACK_PENDING", 256)?,
            max_deliver: parse(&get, "NATS_CONSUMER_MAX_DELIVER", 10)?,
            backoff: parse_backoff(get("NATS_CONSUMER_BACKOFF_MS"))?,
            fetch_batch: parse(&get, "NATS_FETCH_BATCH", 50)?,
            fetch_wait: Duration::from_millis(parse(&get, "NATS_FETCH_WAIT_MS", 2000)?),
            duplicate_window: Duration::from_secs(parse(&get, "NATS_DUPLICATE_WINDOW_SECS", 120)?),

            outbox_batch_size: parse(&get, "OUTBOX_BATCH_SIZE", 100)?,
            outbox_poll_interval: Duration::from_millis(parse(&get, "OUTBOX_POLL_INTERVAL_MS", 2000)?),
            outbox_lease_timeout: Duration::from_secs(parse(&get, "OUTBOX_LEASE_TIMEOUT_SECS", 60)?),
            outbox_max_attempts: parse(&get, "OUTBOX_MAX_ATTEMPTS", 10)?,
            subject_overrides: parse_overrides(get("OUTBOX_SUBJECT_OVERRIDES"))?,

            metrics_log_interval: Duration::from_secs(parse(&get, "METRICS_LOG_INTERVAL_SECS", 60)?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &'static str, value: String, reason: &str| ConfigError::Invalid {
            var,
            value,
            reason: reason.to_string(),
        };

        if self.outbox_batch_size <= 0 {
            return Err(invalid("OUTBOX_BATCH_SIZE", self.outbox_batch_size.to_string(), "must be positive"));
        }
        if self.outbox_max_attempts <= 0 {
            return Err(invalid("OUTBOX_MAX_ATTEMPTS", self.outbox_max_attempts.to_string(), "must be positive"));
        }
        if self.outbox_poll_interval.is_zero() {
            return Err(invalid("OUTBOX_POLL_INTERVAL_MS", "0".to_string(), "must be positive"));
        }
        if self.fetch_batch == 0 {
            return Err(invalid("NATS_FETCH_BATCH", "0".to_string(), "must be positive"));
        }
        if self.max_deliver <= 0 {
            return Err(invalid("NATS_CONSUMER_MAX_DELIVER", self.max_deliver.to_string(), "must be positive"));
        }
        if self.backoff.len() as i64 >= self.max_deliver {
            return Err(invalid(
                "NATS_CONSUMER_BACKOFF_MS",
                format!("{} entries", self.backoff.len()),
                "must have fewer entries than NATS_CONSUMER_MAX_DELIVER",
            ));
        }
        if self.dlq_subject.as_deref() == Some(self.user_created_subject.as_str()) {
            return Err(invalid(
                "NATS_DLQ_SUBJECT",
                self.user_created_subject.clone(),
                "must differ from the consumed subject",
            ));
        }
        Ok(())
    }

    pub fn relay_config(&self) -> OutboxRelayConfig {
        OutboxRelayConfig {
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            lease_timeout: self.outbox_lease_timeout,
            max_attempts: self.outbox_max_attempts,
        }
    }

    pub fn subject_router(&self) -> SubjectRouter {
        self.subject_overrides.iter().fold(
            SubjectRouter::new(self.user_created_subject.clone()),
            |router, (event_type, subject)| router.with_override(event_type.clone(), subject.clone()),
        )
    }

    pub fn consumer_config(&self) -> DurableConsumerConfig {
        DurableConsumerConfig {
            fetch_batch: self.fetch_batch,
            fetch_wait: self.fetch_wait,
            // validated positive
            max_deliver: self.max_deliver.unsigned_abs(),
            backoff: self.backoff.clone(),
            dlq_subject: self.dlq_subject.clone(),
        }
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

/// Comma-separated milliseconds, e.g. `1000,5000,30000`.
fn parse_backoff(raw: Option<String>) -> Result<Vec<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::Invalid {
                    var: "NATS_CONSUMER_BACKOFF_MS",
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// `event.type=subject` pairs separated by commas.
fn parse_overrides(raw: Option<String>) -> Result<Vec<(String, String)>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((event_type, subject)) if !event_type.trim().is_empty() && !subject.trim().is_empty() => {
                Ok((event_type.trim().to_string(), subject.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                var: "OUTBOX_SUBJECT_OVERRIDES",
                value: part.to_string(),
                reason: "expected event_type=subject".to_string(),
            }),
        })
        .collect()
}
