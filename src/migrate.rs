use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Log records. List fields are stored as JSON text. Plain INSERT only;
    // an id collision is a duplicate, never an overwrite.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS logs (
            id TEXT PRIMARY KEY,
            date_gst TEXT NOT NULL,
            group_name TEXT NOT NULL,
            summary TEXT NOT NULL,
            top_keywords TEXT NOT NULL DEFAULT '[]',
            sla_breaches INTEGER NOT NULL DEFAULT 0,
            attachments TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Idempotency ledger: key -> exact response body previously returned.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency (
            key TEXT PRIMARY KEY,
            response_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Async pipeline jobs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            result_summary TEXT,
            error TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Indexes for the query paths (/logs recency, KPI grouping).
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at DESC)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_group_name ON logs(group_name)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
