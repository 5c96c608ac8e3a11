//! Outbox repository for reliable event publishing
//!
//! Rows are inserted inside the caller's transaction and claimed by relays
//! with `FOR UPDATE SKIP LOCKED`, so concurrent relays never lease the same row.

use crate::models::{ClaimParams, NewOutboxEvent, OutboxEvent};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Insert an event into the outbox for later publishing
pub async fn insert_outbox_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events
            (id, aggregate_type, aggregate_id, event_type, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.id)
    .bind(&event.aggregate_type)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Lease up to `batch_size` eligible rows in one statement.
///
/// Eligible: not processed, under the attempt cap, and either never leased or
/// holding a lease older than `lease_timeout`. Rows locked by a concurrent
/// claimant are skipped rather than waited on.
pub async fn claim_batch(
    pool: &PgPool,
    params: &ClaimParams,
) -> Result<Vec<OutboxEvent>, sqlx::Error> {
    let mut events = sqlx::query_as::<_, OutboxEvent>(
        r#"
        WITH candidates AS (
            SELECT id
            FROM outbox_events
            WHERE processed_at IS NULL
              AND attempts < $2
              AND (leased_at IS NULL OR leased_at < NOW() - make_interval(secs => $3))
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE outbox_events o
        SET leased_at = NOW(),
            attempts = o.attempts + 1
        FROM candidates c
        WHERE o.id = c.id
        RETURNING o.id, o.aggregate_type, o.aggregate_id, o.event_type, o.payload,
                  o.created_at, o.leased_at, o.processed_at, o.attempts, o.last_error
        "#,
    )
    .bind(params.batch_size)
    .bind(params.max_attempts)
    .bind(params.lease_timeout.as_secs_f64())
    .fetch_all(pool)
    .await?;

    // RETURNING order is unspecified
    events.sort_by_key(|e| e.created_at);
    Ok(events)
}

/// Mark a row published and release its lease.
///
/// Matches on the lease timestamp returned by the claim, so a relay whose
/// lease expired and was taken over cannot touch the new holder's row.
/// Returns whether the row was updated.
pub async fn mark_processed(
    pool: &PgPool,
    id: Uuid,
    leased_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET processed_at = NOW(), leased_at = NULL
        WHERE id = $1 AND leased_at = $2
        "#,
    )
    .bind(id)
    .bind(leased_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record a publish failure and release the lease. The row stays pending.
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    leased_at: DateTime<Utc>,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET last_error = $3, leased_at = NULL
        WHERE id = $1 AND leased_at = $2
        "#,
    )
    .bind(id)
    .bind(leased_at)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
