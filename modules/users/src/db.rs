use crate::models::{AuditEntry, ClaimParams, IdempotencyRecord, NewOutboxEvent, OutboxEvent, User};
use crate::repos::{audit_repo, idempotency_repo, outbox_repo, user_repo};
use crate::store::{AuditLog, CommandStore, OutboxStore, StoreError, UnitOfWork, UserReader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Initialize a connection pool to the PostgreSQL database
///
/// `DB_MAX_CONNECTIONS` (default 10) and `DB_ACQUIRE_TIMEOUT_SECS` (default 3)
/// come from [`crate::config::Config`].
pub async fn init_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations").run(pool).await
}

/// Store handle over a write pool and a read pool.
///
/// Transactions, claims and lease updates always use the write pool. Lookups of
/// committed users go to the read pool, which is the write pool unless a
/// replica was supplied.
#[derive(Clone)]
pub struct PgStore {
    write: PgPool,
    read: PgPool,
}

impl PgStore {
    pub fn new(write: PgPool) -> Self {
        Self {
            read: write.clone(),
            write,
        }
    }

    pub fn with_read_pool(mut self, read: PgPool) -> Self {
        self.read = read;
        self
    }

    pub fn write_pool(&self) -> &PgPool {
        &self.write
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_idempotency_record(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(idempotency_repo::find_in_tx(&mut self.tx, key).await?)
    }

    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError> {
        Ok(idempotency_repo::insert(&mut self.tx, record).await?)
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        Ok(user_repo::insert_user(&mut self.tx, user).await?)
    }

    async fn insert_outbox_event(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        Ok(outbox_repo::insert_outbox_event(&mut self.tx, event).await?)
    }

    async fn commit(self) -> Result<(), StoreError> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(self.tx.rollback().await?)
    }
}

#[async_trait]
impl CommandStore for PgStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.write.begin().await?;
        Ok(PgUnitOfWork { tx })
    }

    async fn find_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        // Must see the row a concurrent writer just committed
        Ok(idempotency_repo::find(&self.write, key).await?)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_batch(&self, params: &ClaimParams) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(outbox_repo::claim_batch(&self.write, params).await?)
    }

    async fn mark_processed(&self, id: Uuid, leased_at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(outbox_repo::mark_processed(&self.write, id, leased_at).await?)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        leased_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        Ok(outbox_repo::mark_failed(&self.write, id, leased_at, error).await?)
    }
}

#[async_trait]
impl UserReader for PgStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(user_repo::get_user(&self.read, id).await?)
    }

    async fn get_user_consistent(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(user_repo::get_user(&self.write, id).await?)
    }
}

#[async_trait]
impl AuditLog for PgStore {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        Ok(audit_repo::insert_audit_log(&self.write, entry).await?)
    }
}
