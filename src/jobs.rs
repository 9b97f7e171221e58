//! Async job tracker for pipeline invocations.
//!
//! `queued -> running -> {succeeded | failed}`. One worker task owns a
//! job's transitions; terminal states are never left.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::{JobRecord, JobState};

pub async fn create(pool: &SqlitePool, job_id: &str) -> Result<()> {
    sqlx::query("INSERT INTO jobs (job_id, state, queued_at) VALUES (?, ?, ?)")
        .bind(job_id)
        .bind(JobState::Queued.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_running(pool: &SqlitePool, job_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET state = ?, started_at = ? WHERE job_id = ?")
        .bind(JobState::Running.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_succeeded(
    pool: &SqlitePool,
    job_id: &str,
    result_summary: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE jobs SET state = ?, finished_at = ?, result_summary = ? WHERE job_id = ?")
        .bind(JobState::Succeeded.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(result_summary.to_string())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, job_id: &str, error: &serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE jobs SET state = ?, finished_at = ?, error = ? WHERE job_id = ?")
        .bind(JobState::Failed.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(error.to_string())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<JobRecord>> {
    let row = sqlx::query(
        "SELECT job_id, state, queued_at, started_at, finished_at, result_summary, error \
         FROM jobs WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let state_str: String = row.get("state");
    let state = JobState::parse(&state_str)
        .ok_or_else(|| anyhow::anyhow!("unknown job state in store: {}", state_str))?;

    let result_summary: Option<String> = row.get("result_summary");
    let error: Option<String> = row.get("error");

    Ok(Some(JobRecord {
        job_id: row.get("job_id"),
        state,
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        result_summary: result_summary.and_then(|s| serde_json::from_str(&s).ok()),
        error: error.and_then(|s| serde_json::from_str(&s).ok()),
    }))
}

/// Jobs still waiting for a worker, for /health and /metrics.
pub async fn queue_depth(pool: &SqlitePool) -> Result<i64> {
    let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
        .bind(JobState::Queued.as_str())
        .fetch_one(pool)
        .await?;
    Ok(depth)
}
