//! Idempotent command execution
//!
//! A command runs its business mutation and outbox insert in one unit of work.
//! When the caller supplies an idempotency key, the key and the hash of the
//! request body are stored in the same transaction; a retry with the same key
//! and hash replays the stored aggregate id, a retry with a different hash is
//! rejected.

use crate::models::IdempotencyRecord;
use crate::store::{CommandStore, StoreError, UnitOfWork};
use chrono::Utc;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("idempotency key {key} was already used for a different request")]
    IdempotencyConflict { key: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    fn is_unique_violation(&self) -> bool {
        matches!(self, CommandError::Store(e) if e.is_unique_violation())
    }
}

/// Result of a mutation that the ledger can point back to.
pub trait AggregateRef {
    fn aggregate_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome<T> {
    /// The mutation ran and committed.
    Applied(T),
    /// A prior request with the same key and hash already committed.
    Replayed { aggregate_id: String },
}

impl<T> CommandOutcome<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, CommandOutcome::Replayed { .. })
    }
}

/// Lowercase hex SHA-256 of a raw request body.
pub fn request_hash(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

pub struct IdempotentCommandHandler<S> {
    store: S,
}

impl<S: CommandStore> IdempotentCommandHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `mutation` at most once per `key`.
    ///
    /// An empty `key` disables deduplication. The mutation must write its
    /// outbox event through the unit of work it is given; nothing it writes
    /// survives unless the whole command commits.
    pub async fn execute<T, F>(
        &self,
        key: &str,
        request_hash: &str,
        mutation: F,
    ) -> Result<CommandOutcome<T>, CommandError>
    where
        T: AggregateRef + Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, CommandError>> + Send,
    {
        let mut tx = self.store.begin().await?;

        if key.is_empty() {
            let value = match mutation(&mut tx).await {
                Ok(value) => value,
                Err(e) => {
                    discard(tx).await;
                    return Err(e);
                }
            };
            tx.commit().await?;
            return Ok(CommandOutcome::Applied(value));
        }

        if let Some(existing) = tx.find_idempotency_record(key).await? {
            discard(tx).await;
            return resolve_existing(key, request_hash, existing);
        }

        let value = match mutation(&mut tx).await {
            Ok(value) => value,
            // A concurrent request with this key may have won on a constraint the
            // mutation touches before ours reached the ledger
            Err(e) if e.is_unique_violation() => {
                discard(tx).await;
                return match self.store.find_idempotency_record(key).await? {
                    Some(existing) => resolve_existing(key, request_hash, existing),
                    None => Err(e),
                };
            }
            Err(e) => {
                discard(tx).await;
                return Err(e);
            }
        };

        let record = IdempotencyRecord {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            aggregate_id: value.aggregate_id(),
            created_at: Utc::now(),
        };

        match tx.insert_idempotency_record(&record).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                discard(tx).await;
                return self.resolve_race(key, request_hash).await;
            }
            Err(e) => {
                discard(tx).await;
                return Err(e.into());
            }
        }

        match tx.commit().await {
            Ok(()) => Ok(CommandOutcome::Applied(value)),
            Err(e) if e.is_unique_violation() => self.resolve_race(key, request_hash).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Lost the insert race on the ledger: the winner's record is committed now.
    async fn resolve_race<T>(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<CommandOutcome<T>, CommandError> {
        debug!(idempotency_key = %key, "Idempotency key insert raced, re-reading");
        match self.store.find_idempotency_record(key).await? {
            Some(existing) => resolve_existing(key, request_hash, existing),
            None => Err(CommandError::Store(StoreError::UniqueViolation(format!(
                "idempotency key {} conflicted but no record is visible",
                key
            )))),
        }
    }
}

fn resolve_existing<T>(
    key: &str,
    request_hash: &str,
    existing: IdempotencyRecord,
) -> Result<CommandOutcome<T>, CommandError> {
    if existing.request_hash != request_hash {
        warn!(idempotency_key = %key, "Idempotency key reused with a different request body");
        return Err(CommandError::IdempotencyConflict {
            key: key.to_string(),
        });
    }
    Ok(CommandOutcome::Replayed {
        aggregate_id: existing.aggregate_id,
    })
}

async fn discard<U: UnitOfWork>(tx: U) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            request_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(request_hash(b"abc").len(), 64);
        assert_ne!(request_hash(b"abc"), request_hash(b"abd"));
    }

    #[test]
    fn test_replay_requires_matching_hash() {
        let existing = IdempotencyRecord {
            key: "k".to_string(),
            request_hash: "h1".to_string(),
            aggregate_id: "agg-1".to_string(),
            created_at: Utc::now(),
        };

        let replay: CommandOutcome<()> = resolve_existing("k", "h1", existing.clone()).unwrap();
        assert_eq!(
            replay,
            CommandOutcome::Replayed {
                aggregate_id: "agg-1".to_string()
            }
        );

        let conflict = resolve_existing::<()>("k", "h2", existing);
        assert!(matches!(conflict, Err(CommandError::IdempotencyConflict { key }) if key == "k"));
    }
}
