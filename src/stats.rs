//! Store statistics and health overview.
//!
//! Provides a quick summary of what's on disk: record counts, per-group
//! breakdowns, sink locations and sizes. Used by `hvdc stats` to give
//! confidence that ingestion and the rollup are working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::kpi;

/// Per-group breakdown of record counts.
struct GroupStats {
    group_name: String,
    logs_count: i64,
    sla_breaches: i64,
    last_seen: Option<String>,
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
        .fetch_one(&pool)
        .await?;

    let pending_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE state IN ('queued', 'running')",
    )
    .fetch_one(&pool)
    .await?;

    let ledger_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM idempotency")
        .fetch_one(&pool)
        .await?;

    let sqlite_size = std::fs::metadata(config.storage.sqlite_path())
        .map(|m| m.len())
        .unwrap_or(0);
    let csv_size = std::fs::metadata(config.storage.csv_path())
        .map(|m| m.len())
        .unwrap_or(0);
    let duckdb_size = std::fs::metadata(config.storage.duckdb_file())
        .map(|m| m.len())
        .unwrap_or(0);

    println!("HVDC Log Store — Stats");
    println!("======================");
    println!();
    println!(
        "  SQLite:      {} ({})",
        config.storage.sqlite_path().display(),
        format_bytes(sqlite_size)
    );
    println!(
        "  CSV:         {} ({})",
        config.storage.csv_path().display(),
        format_bytes(csv_size)
    );
    println!("  Bronze:      {}", config.storage.bronze_root().display());
    if kpi::duckdb_available(&config.storage) {
        println!(
            "  DuckDB:      {} ({})",
            config.storage.duckdb_file().display(),
            format_bytes(duckdb_size)
        );
    } else {
        println!(
            "  DuckDB:      {} (not built yet — run `hvdc pipeline run`)",
            config.storage.duckdb_file().display()
        );
    }
    println!();
    println!("  Records:     {}", total_logs);
    println!("  Ledger:      {} idempotency entr{}", ledger_entries, if ledger_entries == 1 { "y" } else { "ies" });
    println!("  Jobs:        {} pending", pending_jobs);

    let group_rows = sqlx::query(
        r#"
        SELECT
            group_name,
            COUNT(*) AS logs_count,
            COALESCE(SUM(sla_breaches), 0) AS sla_breaches,
            MAX(date_gst) AS last_seen
        FROM logs
        GROUP BY group_name
        ORDER BY logs_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut group_stats: Vec<GroupStats> = Vec::new();
    for row in &group_rows {
        group_stats.push(GroupStats {
            group_name: row.get("group_name"),
            logs_count: row.get("logs_count"),
            sla_breaches: row.get("sla_breaches"),
            last_seen: row.get("last_seen"),
        });
    }

    if !group_stats.is_empty() {
        println!();
        println!("  By group:");
        println!(
            "  {:<32} {:>6} {:>12}   {}",
            "GROUP", "LOGS", "SLA BREACHES", "LAST SEEN"
        );
        println!("  {}", "-".repeat(72));

        for g in &group_stats {
            println!(
                "  {:<32} {:>6} {:>12}   {}",
                g.group_name,
                g.logs_count,
                g.sla_breaches,
                g.last_seen.as_deref().unwrap_or("never")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
