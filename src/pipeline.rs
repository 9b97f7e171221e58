//! Bronze -> silver -> KPI rollup pipeline.
//!
//! A strictly sequential batch job over the columnar store: load every
//! bronze JSONL line into a raw table, project the cleaned rows into a
//! silver table, then redefine the daily KPI view. Every run is a full
//! recomputation; there is no incremental mode.

use duckdb::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no bronze data found under {0}")]
    NoBronzeData(PathBuf),
    #[error("{stage} stage failed: {message}")]
    Stage { stage: &'static str, message: String },
}

/// Counts reported by a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub bronze_files: usize,
    pub raw_rows: i64,
    pub silver_rows: i64,
}

/// Seam between the HTTP/job layer and the batch job itself. Handlers hold
/// a trait object so tests can substitute a stub runner.
pub trait PipelineRunner: Send + Sync {
    fn run(&self) -> Result<PipelineReport, PipelineError>;
}

/// The DuckDB-backed runner. Opens its own connection per run; callers
/// serialize runs (DuckDB is single-writer).
pub struct DuckDbPipeline {
    bronze_root: PathBuf,
    duckdb_path: PathBuf,
}

impl DuckDbPipeline {
    pub fn new(bronze_root: PathBuf, duckdb_path: PathBuf) -> Self {
        Self {
            bronze_root,
            duckdb_path,
        }
    }

    fn open(&self) -> Result<Connection, PipelineError> {
        if let Some(parent) = self.duckdb_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Stage {
                stage: "bronze",
                message: e.to_string(),
            })?;
        }
        Connection::open(&self.duckdb_path).map_err(|e| PipelineError::Stage {
            stage: "bronze",
            message: e.to_string(),
        })
    }
}

fn count_bronze_files(root: &Path) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path().extension().map(|x| x == "jsonl").unwrap_or(false)
        })
        .count()
}

impl PipelineRunner for DuckDbPipeline {
    fn run(&self) -> Result<PipelineReport, PipelineError> {
        let bronze_files = count_bronze_files(&self.bronze_root);
        if bronze_files == 0 {
            return Err(PipelineError::NoBronzeData(self.bronze_root.clone()));
        }

        let conn = self.open()?;

        // Stage 1: bronze -> raw. Malformed lines are discarded, partitions
        // may disagree on columns (union_by_name).
        let glob = format!("{}/**/*.jsonl", self.bronze_root.display()).replace('\'', "''");
        conn.execute_batch(&format!(
            "CREATE OR REPLACE TABLE raw_logs AS \
             SELECT * FROM read_json_auto('{}', format='newline_delimited', \
             ignore_errors=true, union_by_name=true)",
            glob
        ))
        .map_err(|e| PipelineError::Stage {
            stage: "bronze",
            message: e.to_string(),
        })?;

        // Stage 2: raw -> silver. Fixed column set, text-typed so the KPI
        // view is stable regardless of what read_json_auto inferred. Rows
        // without the primary timestamp are dropped.
        conn.execute_batch(
            "CREATE OR REPLACE TABLE silver_logs AS \
             SELECT CAST(id AS VARCHAR) AS id, \
                    CAST(date_gst AS VARCHAR) AS date_gst, \
                    CAST(group_name AS VARCHAR) AS group_name, \
                    CAST(summary AS VARCHAR) AS summary, \
                    CAST(top_keywords AS VARCHAR) AS top_keywords, \
                    CAST(COALESCE(sla_breaches, 0) AS BIGINT) AS sla_breaches, \
                    CAST(created_at AS VARCHAR) AS created_at \
             FROM raw_logs WHERE date_gst IS NOT NULL",
        )
        .map_err(|e| PipelineError::Stage {
            stage: "silver",
            message: e.to_string(),
        })?;

        // Stage 3: daily KPI view, redefined on every run.
        conn.execute_batch(
            "CREATE OR REPLACE VIEW v_kpi_daily AS \
             SELECT substr(date_gst, 1, 10) AS date, \
                    group_name, \
                    COUNT(*) AS logs_count, \
                    SUM(sla_breaches) AS total_sla_breaches, \
                    COUNT(DISTINCT top_keywords) AS unique_keywords_count \
             FROM silver_logs GROUP BY 1, 2",
        )
        .map_err(|e| PipelineError::Stage {
            stage: "kpi",
            message: e.to_string(),
        })?;

        let raw_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM raw_logs", [], |row| row.get(0))
            .map_err(|e| PipelineError::Stage {
                stage: "kpi",
                message: e.to_string(),
            })?;
        let silver_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM silver_logs", [], |row| row.get(0))
            .map_err(|e| PipelineError::Stage {
                stage: "kpi",
                message: e.to_string(),
            })?;

        Ok(PipelineReport {
            bronze_files,
            raw_rows,
            silver_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn seed_bronze(root: &Path) {
        let dir = root.join("2025").join("08");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("2025-08-09_G1.jsonl"),
            concat!(
                r#"{"id":"a","date_gst":"2025-08-09 10:00","group_name":"G1","summary":"s1","top_keywords":["tide"],"sla_breaches":2,"attachments":[],"created_at":"2025-08-09T06:00:00Z"}"#,
                "\n",
                r#"{"id":"b","date_gst":"2025-08-09 11:00","group_name":"G1","summary":"s2","top_keywords":["berth"],"sla_breaches":1,"attachments":[],"created_at":"2025-08-09T07:00:00Z"}"#,
                "\n",
                "this line is not json\n",
            ),
        )
        .unwrap();
        fs::write(
            dir.join("2025-08-09_G2.jsonl"),
            concat!(
                r#"{"id":"c","date_gst":"2025-08-09 12:00","group_name":"G2","summary":"s3","top_keywords":[],"sla_breaches":0,"attachments":[],"created_at":"2025-08-09T08:00:00Z"}"#,
                "\n",
                r#"{"id":"d","date_gst":null,"group_name":"G2","summary":"dropped","top_keywords":[],"sla_breaches":9,"attachments":[],"created_at":"2025-08-09T08:30:00Z"}"#,
                "\n",
            ),
        )
        .unwrap();
    }

    #[test]
    fn empty_bronze_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let runner = DuckDbPipeline::new(tmp.path().join("bronze"), tmp.path().join("k.duckdb"));
        assert!(matches!(
            runner.run().unwrap_err(),
            PipelineError::NoBronzeData(_)
        ));
    }

    #[test]
    fn full_run_filters_and_aggregates() {
        let tmp = TempDir::new().unwrap();
        let bronze = tmp.path().join("bronze");
        seed_bronze(&bronze);

        let runner = DuckDbPipeline::new(bronze, tmp.path().join("k.duckdb"));
        let report = runner.run().unwrap();
        assert_eq!(report.bronze_files, 2);
        // The malformed line is discarded by the bronze stage and the
        // null-timestamp row by the silver stage.
        assert_eq!(report.raw_rows, 4);
        assert_eq!(report.silver_rows, 3);

        let conn = Connection::open(tmp.path().join("k.duckdb")).unwrap();
        let (logs, breaches): (i64, i64) = conn
            .query_row(
                "SELECT logs_count, total_sla_breaches FROM v_kpi_daily WHERE group_name = 'G1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(logs, 2);
        assert_eq!(breaches, 3);
    }

    #[test]
    fn rerun_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let bronze = tmp.path().join("bronze");
        seed_bronze(&bronze);

        let runner = DuckDbPipeline::new(bronze, tmp.path().join("k.duckdb"));
        let first = runner.run().unwrap();
        let second = runner.run().unwrap();
        assert_eq!(first.raw_rows, second.raw_rows);
        assert_eq!(first.silver_rows, second.silver_rows);

        let conn = Connection::open(tmp.path().join("k.duckdb")).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM v_kpi_daily", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }
}
