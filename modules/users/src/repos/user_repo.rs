use crate::models::User;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub async fn insert_user(
    tx: &mut Transaction<'_, Postgres>,
    user: &User,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users (id, name, email, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(user.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn get_user(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, name, email, created_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}
