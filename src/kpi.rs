//! Daily KPI queries.
//!
//! Reads the rollup view in DuckDB when it is available; otherwise the same
//! aggregation is recomputed straight from the SQLite `logs` table (coarser:
//! no unique-keyword counts). Rows are ordered date descending, group name
//! ascending. The CSV export streams rows as they are produced instead of
//! collecting the result first.

use anyhow::Result;
use duckdb::Connection;
use futures_util::TryStreamExt;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::StorageConfig;
use crate::models::DailyKpiRow;

/// Optional filters shared by `/kpi` and the CSV export.
#[derive(Debug, Clone, Default)]
pub struct KpiFilter {
    pub since: Option<String>,
    pub until: Option<String>,
    pub group_name: Option<String>,
}

impl KpiFilter {
    /// Filters compare on calendar dates; a full timestamp is reduced to
    /// its date prefix.
    fn since_date(&self) -> Option<String> {
        self.since.as_deref().map(date_prefix)
    }

    fn until_date(&self) -> Option<String> {
        self.until.as_deref().map(date_prefix)
    }
}

fn date_prefix(s: &str) -> String {
    s.chars().take(10).collect()
}

/// Query the KPI rows, preferring the columnar rollup.
pub async fn query_kpi(
    storage: &StorageConfig,
    pool: &SqlitePool,
    filter: &KpiFilter,
) -> Result<Vec<DailyKpiRow>> {
    let duckdb_path = storage.duckdb_file();
    if duckdb_path.exists() {
        let filter_clone = filter.clone();
        let result =
            tokio::task::spawn_blocking(move || query_duckdb(&duckdb_path, &filter_clone)).await?;
        match result {
            Ok(rows) => return Ok(rows),
            Err(e) => warn!("duckdb KPI query failed, falling back to sqlite: {}", e),
        }
    }
    query_sqlite(pool, filter).await
}

fn query_duckdb(path: &Path, filter: &KpiFilter) -> Result<Vec<DailyKpiRow>> {
    // Read-only so reporting never contends for DuckDB's writer lock;
    // concurrent read-only connections coexist.
    let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
    let conn = Connection::open_with_flags(path, config)?;

    let mut sql = String::from(
        "SELECT date, group_name, logs_count, total_sla_breaches, unique_keywords_count \
         FROM v_kpi_daily WHERE 1=1",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(since) = filter.since_date() {
        sql.push_str(" AND date >= ?");
        params.push(since);
    }
    if let Some(until) = filter.until_date() {
        sql.push_str(" AND date <= ?");
        params.push(until);
    }
    if let Some(ref group) = filter.group_name {
        sql.push_str(" AND group_name LIKE ?");
        params.push(format!("%{}%", group));
    }
    sql.push_str(" ORDER BY date DESC, group_name");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params_from_iter(params.iter()), |row| {
        Ok(DailyKpiRow {
            date: row.get(0)?,
            group_name: row.get(1)?,
            logs_count: row.get(2)?,
            total_sla_breaches: row.get(3)?,
            unique_keywords_count: Some(row.get(4)?),
        })
    })?;

    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn sqlite_kpi_sql(filter: &KpiFilter) -> (String, Vec<String>) {
    let mut sql = String::from(
        "SELECT substr(date_gst, 1, 10) AS date, group_name, COUNT(*) AS logs_count, \
         SUM(COALESCE(sla_breaches, 0)) AS total_sla_breaches \
         FROM logs WHERE 1=1",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(since) = filter.since_date() {
        sql.push_str(" AND substr(date_gst, 1, 10) >= ?");
        params.push(since);
    }
    if let Some(until) = filter.until_date() {
        sql.push_str(" AND substr(date_gst, 1, 10) <= ?");
        params.push(until);
    }
    if let Some(ref group) = filter.group_name {
        sql.push_str(" AND group_name LIKE ?");
        params.push(format!("%{}%", group));
    }
    sql.push_str(" GROUP BY 1, 2 ORDER BY 1 DESC, 2");
    (sql, params)
}

async fn query_sqlite(pool: &SqlitePool, filter: &KpiFilter) -> Result<Vec<DailyKpiRow>> {
    let (sql, params) = sqlite_kpi_sql(filter);
    let mut query = sqlx::query_as::<_, (String, String, i64, i64)>(&sql);
    for p in &params {
        query = query.bind(p);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|(date, group_name, logs_count, total_sla_breaches)| DailyKpiRow {
            date,
            group_name,
            logs_count,
            total_sla_breaches,
            unique_keywords_count: None,
        })
        .collect())
}

/// Fixed CSV export header (CRLF line endings, matching the row format).
pub const CSV_EXPORT_HEADER: &str = "date,group_name,logs,sla_breaches\r\n";

pub fn csv_line(row: &DailyKpiRow) -> String {
    let mut buf = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .has_headers(false)
            .from_writer(&mut buf);
        // The export intentionally omits unique keyword counts so the
        // shape is identical whichever source produced the rows.
        let _ = writer.write_record([
            row.date.as_str(),
            row.group_name.as_str(),
            &row.logs_count.to_string(),
            &row.total_sla_breaches.to_string(),
        ]);
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Produce the CSV export as a bounded channel of chunks, header first.
///
/// Rows flow through the channel as each source yields them; the export is
/// finite and not restartable mid-stream. A failure after the header is
/// logged and simply ends the stream.
pub fn spawn_csv_export(
    storage: StorageConfig,
    pool: SqlitePool,
    filter: KpiFilter,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        if tx.send(CSV_EXPORT_HEADER.to_string()).await.is_err() {
            return;
        }

        let duckdb_path = storage.duckdb_file();
        if duckdb_path.exists() {
            let blocking_tx = tx.clone();
            let filter_clone = filter.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                stream_duckdb_csv(&duckdb_path, &filter_clone, &blocking_tx)
            })
            .await;
            match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => warn!("duckdb CSV export failed, falling back to sqlite: {}", e),
                Err(e) => {
                    warn!("csv export task panicked: {}", e);
                    return;
                }
            }
        }

        if let Err(e) = stream_sqlite_csv(&pool, &filter, &tx).await {
            warn!("sqlite CSV export failed mid-stream: {}", e);
        }
    });

    rx
}

fn stream_duckdb_csv(
    path: &Path,
    filter: &KpiFilter,
    tx: &mpsc::Sender<String>,
) -> Result<()> {
    let rows = query_duckdb(path, filter)
        .map_err(|e| anyhow::anyhow!("rollup view unavailable: {}", e))?;
    for row in rows {
        if tx.blocking_send(csv_line(&row)).is_err() {
            break; // client went away
        }
    }
    Ok(())
}

async fn stream_sqlite_csv(
    pool: &SqlitePool,
    filter: &KpiFilter,
    tx: &mpsc::Sender<String>,
) -> Result<()> {
    let (sql, params) = sqlite_kpi_sql(filter);
    let mut query = sqlx::query_as::<_, (String, String, i64, i64)>(&sql);
    for p in &params {
        query = query.bind(p);
    }

    let mut stream = query.fetch(pool);
    while let Some((date, group_name, logs_count, total_sla_breaches)) =
        stream.try_next().await?
    {
        let row = DailyKpiRow {
            date,
            group_name,
            logs_count,
            total_sla_breaches,
            unique_keywords_count: None,
        };
        if tx.send(csv_line(&row)).await.is_err() {
            break;
        }
    }
    Ok(())
}

pub fn duckdb_available(storage: &StorageConfig) -> bool {
    storage.duckdb_file().exists()
}

/// Used by `hvdc kpi` to keep CLI output shaped like the HTTP response.
pub fn rows_to_json(rows: &[DailyKpiRow], filter: &KpiFilter) -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "since": filter.since.clone().unwrap_or_default(),
        "until": filter.until.clone().unwrap_or_default(),
        "metrics": rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE logs (
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
        .await
        .unwrap();

        for (id, date_gst, group, sla) in [
            ("a", "2025-08-09 10:00", "G1", 2),
            ("b", "2025-08-09 11:00", "G1", 1),
            ("c", "2025-08-10 09:00", "G1", 0),
            ("d", "2025-08-09 12:00", "G2", 5),
        ] {
            sqlx::query(
                "INSERT INTO logs (id, date_gst, group_name, summary, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(date_gst)
            .bind(group)
            .bind("s")
            .bind("2025-08-09T06:00:00Z")
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query("UPDATE logs SET sla_breaches = ? WHERE id = ?")
                .bind(sla)
                .bind(id)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn no_duckdb_storage() -> StorageConfig {
        StorageConfig {
            data_dir: PathBuf::from("/nonexistent-hvdc-test"),
            bronze_dir: None,
            duckdb_path: None,
        }
    }

    #[tokio::test]
    async fn sqlite_fallback_aggregates_and_orders() {
        let pool = seeded_pool().await;
        let rows = query_kpi(&no_duckdb_storage(), &pool, &KpiFilter::default())
            .await
            .unwrap();

        // date DESC, then group_name ASC.
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].date.as_str(), rows[0].group_name.as_str()), ("2025-08-10", "G1"));
        assert_eq!((rows[1].date.as_str(), rows[1].group_name.as_str()), ("2025-08-09", "G1"));
        assert_eq!((rows[2].date.as_str(), rows[2].group_name.as_str()), ("2025-08-09", "G2"));

        assert_eq!(rows[1].logs_count, 2);
        assert_eq!(rows[1].total_sla_breaches, 3);
        assert!(rows[1].unique_keywords_count.is_none());
    }

    #[tokio::test]
    async fn filters_restrict_by_date_and_group() {
        let pool = seeded_pool().await;

        let filter = KpiFilter {
            since: Some("2025-08-10".to_string()),
            ..Default::default()
        };
        let rows = query_kpi(&no_duckdb_storage(), &pool, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, "2025-08-10");

        let filter = KpiFilter {
            until: Some("2025-08-09 23:59".to_string()),
            group_name: Some("G2".to_string()),
            ..Default::default()
        };
        let rows = query_kpi(&no_duckdb_storage(), &pool, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_sla_breaches, 5);
    }

    #[tokio::test]
    async fn csv_export_streams_header_then_rows() {
        let pool = seeded_pool().await;
        let mut rx = spawn_csv_export(no_duckdb_storage(), pool, KpiFilter::default());

        let mut body = String::new();
        while let Some(chunk) = rx.recv().await {
            body.push_str(&chunk);
        }
        let lines: Vec<&str> = body.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines[0], "date,group_name,logs,sla_breaches");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "2025-08-10,G1,1,0");
    }

    fn seeded_warehouse(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE silver_logs (
                date_gst VARCHAR, group_name VARCHAR,
                sla_breaches BIGINT, top_keywords VARCHAR
            );
            INSERT INTO silver_logs VALUES
                ('2025-08-09 10:00', 'G1', 2, '["berth"]'),
                ('2025-08-09 11:00', 'G1', 1, '["tide"]');
            CREATE VIEW v_kpi_daily AS
                SELECT substr(date_gst, 1, 10) AS date,
                       group_name,
                       COUNT(*) AS logs_count,
                       SUM(sla_breaches) AS total_sla_breaches,
                       COUNT(DISTINCT top_keywords) AS unique_keywords_count
                FROM silver_logs GROUP BY 1, 2;
            "#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn warehouse_reads_coexist_without_falling_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("k.duckdb");
        seeded_warehouse(&path);

        let storage = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            bronze_dir: None,
            duckdb_path: Some(path.clone()),
        };
        // The fallback source would produce 3 rows with null keyword counts;
        // the warehouse produces 1 row with a real count.
        let pool = seeded_pool().await;

        // Another open reader must not push queries onto the fallback.
        let held_config = duckdb::Config::default()
            .access_mode(duckdb::AccessMode::ReadOnly)
            .unwrap();
        let held = Connection::open_with_flags(&path, held_config).unwrap();

        let rows = query_kpi(&storage, &pool, &KpiFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "G1");
        assert_eq!(rows[0].logs_count, 2);
        assert_eq!(rows[0].unique_keywords_count, Some(2));
        drop(held);
    }

    #[test]
    fn csv_line_quotes_when_needed() {
        let row = DailyKpiRow {
            date: "2025-08-09".to_string(),
            group_name: "Ops, Night Shift".to_string(),
            logs_count: 1,
            total_sla_breaches: 0,
            unique_keywords_count: None,
        };
        assert_eq!(csv_line(&row), "2025-08-09,\"Ops, Night Shift\",1,0\r\n");
    }
}
