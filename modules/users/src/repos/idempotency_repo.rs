use crate::models::IdempotencyRecord;
use sqlx::{PgPool, Postgres, Transaction};

pub async fn find_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
) -> Result<Option<IdempotencyRecord>, sqlx::Error> {
    sqlx::query_as::<_, IdempotencyRecord>(
        r#"
        SELECT key, request_hash, aggregate_id, created_at
        FROM idempotency_keys
        WHERE key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(&mut **tx)
    .await
}

pub async fn find(pool: &PgPool, key: &str) -> Result<Option<IdempotencyRecord>, sqlx::Error> {
    sqlx::query_as::<_, IdempotencyRecord>(
        r#"
        SELECT key, request_hash, aggregate_id, created_at
        FROM idempotency_keys
        WHERE key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Fails with a unique violation when another request already holds `record.key`.
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    record: &IdempotencyRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, request_hash, aggregate_id, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(&record.key)
    .bind(&record.request_hash)
    .bind(&record.aggregate_id)
    .bind(record.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
