//! Idempotency ledger: key -> exact response body previously returned.
//!
//! `lookup` runs before any mutating work; a hit replays the stored body
//! byte for byte and skips all reprocessing. `store` runs only after every
//! sink write succeeded, and sweeps entries older than the configured
//! retention window while it is there.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Key precedence: explicit header, else the body's request_id, else a
/// fresh UUID (which means the request is never deduplicated).
pub fn resolve_key(header: Option<&str>, body_request_id: Option<&str>) -> String {
    header
        .or(body_request_id)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Returns the stored response body for `key`, if any.
pub async fn lookup(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT response_json FROM idempotency WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(stored)
}

/// Records the response returned for `key`. Entries are immutable: if a
/// concurrent request already stored one, the existing entry wins.
pub async fn store(
    pool: &SqlitePool,
    key: &str,
    response_json: &str,
    retention_days: u32,
) -> Result<()> {
    if retention_days > 0 {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        sqlx::query("DELETE FROM idempotency WHERE created_at < ?")
            .bind(&cutoff)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "INSERT OR IGNORE INTO idempotency (key, response_json, created_at) VALUES (?, ?, ?)",
    )
    .bind(key)
    .bind(response_json)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}
