//! Store collaborator seams
//!
//! The command handler, relay and consumer only see these traits. `PgStore`
//! (in `db`) is the production handle; `InMemoryStore` backs tests and local
//! runs.

mod memory;

pub use memory::InMemoryStore;

use crate::models::{AuditEntry, ClaimParams, IdempotencyRecord, NewOutboxEvent, OutboxEvent, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write; carries the constraint name when known
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return StoreError::UniqueViolation(
                    db_err.constraint().unwrap_or("unknown").to_string(),
                );
            }
        }
        StoreError::Database(err)
    }
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

/// One atomic transaction. Dropping without commit discards every write.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_idempotency_record(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError>;

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn insert_outbox_event(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    type Tx: UnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Read a committed idempotency record outside any transaction.
    async fn find_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically lease up to `batch_size` eligible rows, oldest first.
    ///
    /// Each returned row has `leased_at` set and `attempts` already incremented.
    async fn claim_batch(&self, params: &ClaimParams) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Mark a row published and release its lease.
    ///
    /// Only applies while the row still carries the lease taken at `leased_at`;
    /// returns `false` when the lease was lost to another claimant.
    async fn mark_processed(&self, id: Uuid, leased_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record a publish failure and release the lease, under the same
    /// lease-holder rule as [`OutboxStore::mark_processed`].
    async fn mark_failed(
        &self,
        id: Uuid,
        leased_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserReader: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Read that must observe the caller's own committed writes.
    async fn get_user_consistent(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.get_user(id).await
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}
