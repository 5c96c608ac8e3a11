//! In-process store with real transaction semantics
//!
//! Writes inside a unit of work are staged and applied under one lock on
//! commit, with uniqueness re-checked at that point. Claims run under the same
//! lock, which gives the per-row mutual exclusion the relay relies on.

use super::{AuditLog, CommandStore, OutboxStore, StoreError, UnitOfWork, UserReader};
use crate::models::{AuditEntry, ClaimParams, IdempotencyRecord, NewOutboxEvent, OutboxEvent, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const EMAIL_CONSTRAINT: &str = "users_email_unique";
const KEY_CONSTRAINT: &str = "idempotency_keys_pkey";

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    outbox: Vec<OutboxEvent>,
    idempotency: HashMap<String, IdempotencyRecord>,
    audit: Vec<AuditEntry>,
    fail_outbox_inserts: bool,
    audit_failures_remaining: usize,
    racer: Option<(User, IdempotencyRecord)>,
}

impl Inner {
    fn email_taken(&self, email: &str) -> bool {
        self.users.values().any(|u| u.email == email)
    }

    fn apply_user(&mut self, user: User) -> Result<(), StoreError> {
        if self.users.contains_key(&user.id) || self.email_taken(&user.email) {
            return Err(StoreError::UniqueViolation(EMAIL_CONSTRAINT.to_string()));
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    /// Row `id` if it still carries the lease taken at `leased_at`.
    fn lease_holder(&mut self, id: Uuid, leased_at: DateTime<Utc>) -> Option<&mut OutboxEvent> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id && e.leased_at == Some(leased_at))
    }

    fn push_outbox(&mut self, event: NewOutboxEvent) {
        self.outbox.push(OutboxEvent {
            id: event.id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            created_at: Utc::now(),
            leased_at: None,
            processed_at: None,
            attempts: 0,
            last_error: None,
        });
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed outbox row directly, bypassing any command.
    pub async fn seed_outbox_event(&self, event: NewOutboxEvent) {
        self.inner.lock().await.push_outbox(event);
    }

    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.inner.lock().await.outbox.clone()
    }

    pub async fn outbox_event(&self, id: Uuid) -> Option<OutboxEvent> {
        self.inner
            .lock()
            .await
            .outbox
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn user_count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    pub async fn idempotency_records(&self) -> Vec<IdempotencyRecord> {
        self.inner.lock().await.idempotency.values().cloned().collect()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    /// Move every active lease `by` into the past, as if the holder stalled.
    pub async fn backdate_leases(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).ok();
        let mut inner = self.inner.lock().await;
        for event in inner.outbox.iter_mut() {
            if let Some(leased_at) = event.leased_at {
                let moved = by.and_then(|by| leased_at.checked_sub_signed(by));
                event.leased_at = Some(moved.unwrap_or(DateTime::<Utc>::MIN_UTC));
            }
        }
    }

    pub async fn fail_outbox_inserts(&self, fail: bool) {
        self.inner.lock().await.fail_outbox_inserts = fail;
    }

    /// Fail the next `count` audit writes.
    pub async fn fail_audit_writes(&self, count: usize) {
        self.inner.lock().await.audit_failures_remaining = count;
    }

    /// Commit `user` and `record` from a competing request the moment a
    /// transaction misses on `record.key`, reproducing a lost insert race.
    pub async fn race_next_lookup(&self, user: User, record: IdempotencyRecord) {
        self.inner.lock().await.racer = Some((user, record));
    }
}

pub struct InMemoryTx {
    inner: Arc<Mutex<Inner>>,
    users: Vec<User>,
    outbox: Vec<NewOutboxEvent>,
    keys: Vec<IdempotencyRecord>,
}

#[async_trait]
impl UnitOfWork for InMemoryTx {
    async fn find_idempotency_record(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        if let Some(staged) = self.keys.iter().find(|r| r.key == key) {
            return Ok(Some(staged.clone()));
        }

        let mut inner = self.inner.lock().await;
        let found = inner.idempotency.get(key).cloned();
        if found.is_none() && inner.racer.as_ref().is_some_and(|(_, r)| r.key == key) {
            if let Some((user, record)) = inner.racer.take() {
                inner.apply_user(user)?;
                inner.idempotency.insert(record.key.clone(), record);
            }
        }
        Ok(found)
    }

    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError> {
        let taken = self.keys.iter().any(|r| r.key == record.key)
            || self.inner.lock().await.idempotency.contains_key(&record.key);
        if taken {
            return Err(StoreError::UniqueViolation(KEY_CONSTRAINT.to_string()));
        }
        self.keys.push(record.clone());
        Ok(())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        let taken = self.users.iter().any(|u| u.email == user.email)
            || self.inner.lock().await.email_taken(&user.email);
        if taken {
            return Err(StoreError::UniqueViolation(EMAIL_CONSTRAINT.to_string()));
        }
        self.users.push(user.clone());
        Ok(())
    }

    async fn insert_outbox_event(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        if self.inner.lock().await.fail_outbox_inserts {
            return Err(StoreError::Unavailable("outbox insert failed".to_string()));
        }
        self.outbox.push(event.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        // Re-check everything before touching state so a failed commit writes nothing
        for record in &self.keys {
            if inner.idempotency.contains_key(&record.key) {
                return Err(StoreError::UniqueViolation(KEY_CONSTRAINT.to_string()));
            }
        }
        for user in &self.users {
            if inner.email_taken(&user.email) {
                return Err(StoreError::UniqueViolation(EMAIL_CONSTRAINT.to_string()));
            }
        }

        for user in self.users {
            inner.apply_user(user)?;
        }
        for record in self.keys {
            inner.idempotency.insert(record.key.clone(), record);
        }
        for event in self.outbox {
            inner.push_outbox(event);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CommandStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTx {
            inner: Arc::clone(&self.inner),
            users: Vec::new(),
            outbox: Vec::new(),
            keys: Vec::new(),
        })
    }

    async fn find_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.inner.lock().await.idempotency.get(key).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_batch(&self, params: &ClaimParams) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let expired_before = chrono::Duration::from_std(params.lease_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = usize::try_from(params.batch_size).unwrap_or(0);

        let mut inner = self.inner.lock().await;
        let mut eligible: Vec<usize> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.processed_at.is_none()
                    && e.attempts < params.max_attempts
                    && e.leased_at.map_or(true, |leased| leased < expired_before)
            })
            .map(|(idx, _)| idx)
            .collect();
        eligible.sort_by_key(|idx| inner.outbox[*idx].created_at);
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for idx in eligible {
            let event = &mut inner.outbox[idx];
            event.leased_at = Some(now);
            event.attempts += 1;
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid, leased_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(event) = inner.lease_holder(id, leased_at) else {
            return Ok(false);
        };
        event.processed_at = Some(Utc::now());
        event.leased_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        leased_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(event) = inner.lease_holder(id, leased_at) else {
            return Ok(false);
        };
        event.last_error = Some(error.to_string());
        event.leased_at = None;
        Ok(true)
    }
}

#[async_trait]
impl UserReader for InMemoryStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl AuditLog for InMemoryStore {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.audit_failures_remaining > 0 {
            inner.audit_failures_remaining -= 1;
            return Err(StoreError::Unavailable("audit write failed".to_string()));
        }
        inner.audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(batch_size: i64) -> ClaimParams {
        ClaimParams {
            batch_size,
            lease_timeout: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    fn event(aggregate_id: &str) -> NewOutboxEvent {
        NewOutboxEvent::new("user", aggregate_id, "user.created", b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_outbox_event(&event("a")).await.unwrap();
        assert!(store.outbox_events().await.is_empty());

        tx.rollback().await.unwrap();
        assert!(store.outbox_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_key_taken_meanwhile() {
        let store = InMemoryStore::new();
        let record = IdempotencyRecord {
            key: "k".to_string(),
            request_hash: "h".to_string(),
            aggregate_id: "a".to_string(),
            created_at: Utc::now(),
        };

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert_idempotency_record(&record).await.unwrap();
        second.insert_idempotency_record(&record).await.unwrap();
        second.insert_outbox_event(&event("a")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(store.outbox_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_leases_and_skips_leased_rows() {
        let store = InMemoryStore::new();
        for id in ["a", "b", "c"] {
            store.seed_outbox_event(event(id)).await;
        }

        let first = store.claim_batch(&params(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.leased_at.is_some() && e.attempts == 1));

        let second = store.claim_batch(&params(10)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].aggregate_id, "c");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = InMemoryStore::new();
        store.seed_outbox_event(event("a")).await;
        store.claim_batch(&params(10)).await.unwrap();
        assert!(store.claim_batch(&params(10)).await.unwrap().is_empty());

        store.backdate_leases(Duration::from_secs(61)).await;
        let reclaimed = store.claim_batch(&params(10)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_mark_processed_clears_lease() {
        let store = InMemoryStore::new();
        store.seed_outbox_event(event("a")).await;
        let claimed = store.claim_batch(&params(10)).await.unwrap();
        let lease = claimed[0].leased_at.unwrap();
        assert!(store.mark_processed(claimed[0].id, lease).await.unwrap());

        let row = store.outbox_event(claimed[0].id).await.unwrap();
        assert!(row.processed_at.is_some());
        assert!(row.leased_at.is_none());
        store.backdate_leases(Duration::from_secs(600)).await;
        assert!(store.claim_batch(&params(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let store = InMemoryStore::new();
        store.seed_outbox_event(event("a")).await;

        let stale = store.claim_batch(&params(10)).await.unwrap().remove(0);
        store.backdate_leases(Duration::from_secs(61)).await;
        let current = store.claim_batch(&params(10)).await.unwrap().remove(0);
        assert_eq!(current.id, stale.id);

        let stale_lease = stale.leased_at.unwrap();
        assert!(!store.mark_failed(stale.id, stale_lease, "late").await.unwrap());
        assert!(!store.mark_processed(stale.id, stale_lease).await.unwrap());

        // The second claimant still holds the row
        assert!(store.claim_batch(&params(10)).await.unwrap().is_empty());
        let row = store.outbox_event(stale.id).await.unwrap();
        assert_eq!(row.leased_at, current.leased_at);
        assert!(row.last_error.is_none());
        assert!(row.processed_at.is_none());

        let lease = current.leased_at.unwrap();
        assert!(store.mark_processed(current.id, lease).await.unwrap());
    }
}
