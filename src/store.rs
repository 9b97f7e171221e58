//! Durable record store: best-effort fan-out to CSV, SQLite, and bronze JSONL.
//!
//! The three sinks are written in a fixed order with no cross-sink
//! transaction; a failure surfaces to the caller but writes that already
//! happened stay in place. Records are immutable once appended.

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::mask;
use crate::models::LogRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this id already exists. Mapped to 409, never retried
    /// into an overwrite.
    #[error("duplicate record id: {0}")]
    Duplicate(String),
    #[error("{sink} write failed: {message}")]
    Sink { sink: &'static str, message: String },
}

/// Handle over the three sinks, constructed once at startup and shared by
/// reference. The CSV lock keeps concurrent appends from interleaving lines.
pub struct LogStore {
    storage: StorageConfig,
    pool: SqlitePool,
    csv_lock: Mutex<()>,
}

/// Row shape returned by `GET /logs` (created_at as stored, RFC 3339).
#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub id: String,
    pub date_gst: String,
    pub group_name: String,
    pub summary: String,
    pub top_keywords: Vec<String>,
    pub sla_breaches: i64,
    pub attachments: Vec<String>,
    pub created_at: String,
}

impl LogStore {
    pub fn new(storage: StorageConfig, pool: SqlitePool) -> Self {
        Self {
            storage,
            pool,
            csv_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Append one record to all three sinks, in order: CSV, SQLite, bronze.
    pub async fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.append_csv(record).await.map_err(|e| StoreError::Sink {
            sink: "csv",
            message: e.to_string(),
        })?;
        self.insert_sqlite(record).await?;
        self.append_bronze(record).map_err(|e| StoreError::Sink {
            sink: "bronze",
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// The file work is blocking, so it runs off the async executor; the
    /// lock stays held across it to keep rows from interleaving.
    async fn append_csv(&self, record: &LogRecord) -> anyhow::Result<()> {
        let _guard = self.csv_lock.lock().await;
        let path = self.storage.csv_path();
        let record = record.clone();
        tokio::task::spawn_blocking(move || write_csv_row(&path, &record)).await??;
        Ok(())
    }

    async fn insert_sqlite(&self, record: &LogRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO logs (id, date_gst, group_name, summary, top_keywords,
                              sla_breaches, attachments, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.date_gst)
        .bind(&record.group_name)
        .bind(&record.summary)
        .bind(serde_json::to_string(&record.top_keywords).unwrap_or_else(|_| "[]".into()))
        .bind(record.sla_breaches as i64)
        .bind(serde_json::to_string(&record.attachments).unwrap_or_else(|_| "[]".into()))
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(StoreError::Duplicate(record.id.clone()))
            }
            Err(e) => Err(StoreError::Sink {
                sink: "sqlite",
                message: e.to_string(),
            }),
        }
    }

    /// Append the record (summary PII-masked) to its dated, per-group
    /// bronze JSONL partition. Lines are only ever appended.
    fn append_bronze(&self, record: &LogRecord) -> anyhow::Result<()> {
        let path = self.bronze_partition(record)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut masked = record.clone();
        masked.summary = mask::mask_pii(&record.summary);
        let line = serde_json::to_string(&masked)?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn bronze_partition(&self, record: &LogRecord) -> anyhow::Result<PathBuf> {
        let dt = NaiveDateTime::parse_from_str(&record.date_gst, "%Y-%m-%d %H:%M")?;
        let group = mask::sanitize_group_name(&record.group_name);
        let dir = self
            .storage
            .bronze_root()
            .join(dt.format("%Y").to_string())
            .join(dt.format("%m").to_string());
        Ok(dir.join(format!("{}_{}.jsonl", dt.format("%Y-%m-%d"), group)))
    }

    /// Most recent rows, newest first.
    pub async fn recent(
        &self,
        limit: i64,
        since: Option<&str>,
        group_name: Option<&str>,
    ) -> anyhow::Result<Vec<LogRow>> {
        let mut sql = String::from(
            "SELECT id, date_gst, group_name, summary, top_keywords, sla_breaches, \
             attachments, created_at FROM logs WHERE 1=1",
        );
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if group_name.is_some() {
            sql.push_str(" AND group_name LIKE ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, (String, String, String, String, String, i64, String, String)>(&sql);
        if let Some(s) = since {
            query = query.bind(s.to_string());
        }
        if let Some(g) = group_name {
            query = query.bind(format!("%{}%", g));
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, date_gst, group_name, summary, keywords, sla, attachments, created_at)| {
                    LogRow {
                        id,
                        date_gst,
                        group_name,
                        summary,
                        top_keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                        sla_breaches: sla,
                        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
                        created_at,
                    }
                },
            )
            .collect())
    }

    /// Total stored records, for /health and /metrics.
    pub async fn record_count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn write_csv_row(path: &Path, record: &LogRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let header_needed = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut writer = csv::Writer::from_writer(file);
    if header_needed {
        writer.write_record([
            "id",
            "date_gst",
            "group_name",
            "summary",
            "top_keywords",
            "sla_breaches",
            "attachments",
            "created_at",
        ])?;
    }
    writer.write_record([
        record.id.as_str(),
        record.date_gst.as_str(),
        record.group_name.as_str(),
        record.summary.as_str(),
        &serde_json::to_string(&record.top_keywords)?,
        &record.sla_breaches.to_string(),
        &serde_json::to_string(&record.attachments)?,
        &record.created_at.to_rfc3339(),
    ])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppendLogRequest;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn test_store(tmp: &TempDir) -> LogStore {
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

        let storage = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            bronze_dir: None,
            duckdb_path: None,
        };
        LogStore::new(storage, pool)
    }

    fn record(id: &str, group: &str) -> LogRecord {
        LogRecord::from_request(
            &AppendLogRequest {
                request_id: None,
                date_gst: "2025-08-09 10:00".to_string(),
                group_name: group.to_string(),
                summary: "call +971 50-123-4567 about berth".to_string(),
                top_keywords: vec!["berth".to_string()],
                sla_breaches: 2,
                attachments: vec![],
                signature: None,
            },
            id.to_string(),
        )
    }

    #[tokio::test]
    async fn append_writes_all_three_sinks() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        store.append(&record("r1", "Jopetwil 71 Group")).await.unwrap();

        // CSV: header + one row.
        let csv = std::fs::read_to_string(store.storage().csv_path()).unwrap();
        assert!(csv.starts_with("id,date_gst,group_name,summary,"));
        assert_eq!(csv.lines().count(), 2);

        // SQLite row present.
        assert_eq!(store.record_count().await.unwrap(), 1);

        // Bronze partition: dated path, masked summary.
        let bronze = tmp
            .path()
            .join("bronze/2025/08/2025-08-09_Jopetwil-71-Group.jsonl");
        let line = std::fs::read_to_string(&bronze).unwrap();
        assert!(line.contains("\"summary\":\"call **** about berth\""));
        assert!(!line.contains("123-4567"));
    }

    #[tokio::test]
    async fn duplicate_id_is_distinguished() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        store.append(&record("same", "G1")).await.unwrap();
        let err = store.append(&record("same", "G1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // The CSV sink was written before the collision surfaced; that
        // partial write is part of the contract.
        let csv = std::fs::read_to_string(store.storage().csv_path()).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_filters_and_orders() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        store.append(&record("a", "Alpha Group")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&record("b", "Beta Group")).await.unwrap();

        let rows = store.recent(10, None, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "b");

        let alpha = store.recent(10, None, Some("Alpha")).await.unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].group_name, "Alpha Group");
        assert_eq!(alpha[0].sla_breaches, 2);
        assert_eq!(alpha[0].top_keywords, vec!["berth".to_string()]);
    }
}
