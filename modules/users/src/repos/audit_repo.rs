use crate::models::AuditEntry;
use sqlx::PgPool;

pub async fn insert_audit_log(pool: &PgPool, entry: &AuditEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (event_type, payload)
        VALUES ($1, $2)
        "#,
    )
    .bind(&entry.event_type)
    .bind(&entry.payload)
    .execute(pool)
    .await?;

    Ok(())
}
