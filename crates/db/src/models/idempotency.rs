use chrono::Utc;
use sqlx::SqlitePool;

/// Hash-set helper used by the Hosting-Service Adapter's `addCommentWithIdempotencyKey`:
/// records a key the first time it's seen so a second call with the same key is recognized as
/// a duplicate without re-paginating the hosting service's comment list.
pub async fn mark_seen(pool: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO processed_comment_keys (idempotency_key, created_at) VALUES (?, ?) \
         ON CONFLICT(idempotency_key) DO NOTHING",
    )
    .bind(key)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn has_seen(pool: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT idempotency_key FROM processed_comment_keys WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}
