//! Core data types for the log store.
//!
//! These types represent the submitted log entries, idempotency records,
//! pipeline jobs, and KPI rows that flow through ingestion and reporting.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum group name length accepted on ingestion.
pub const MAX_GROUP_NAME_LEN: usize = 200;
/// Maximum summary length accepted on ingestion.
pub const MAX_SUMMARY_LEN: usize = 5000;
/// Maximum length of a single keyword.
pub const MAX_KEYWORD_LEN: usize = 64;

fn date_gst_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}$").unwrap())
}

/// Body of `POST /logs`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendLogRequest {
    /// Client-supplied idempotency key / record id (UUID recommended).
    #[serde(default)]
    pub request_id: Option<String>,
    /// Local timestamp, `YYYY-MM-DD HH:MM` in Gulf Standard Time.
    pub date_gst: String,
    pub group_name: String,
    pub summary: String,
    #[serde(default)]
    pub top_keywords: Vec<String>,
    #[serde(default)]
    pub sla_breaches: u32,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Optional HMAC-SHA256 (base64) of the raw body; alternative to the header.
    #[serde(default)]
    pub signature: Option<String>,
}

impl AppendLogRequest {
    /// Field-level validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if !date_gst_pattern().is_match(&self.date_gst) {
            return Err(format!(
                "date_gst must match YYYY-MM-DD HH:MM, got '{}'",
                self.date_gst
            ));
        }
        if self.group_name.is_empty() || self.group_name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(format!(
                "group_name must be 1..={} characters",
                MAX_GROUP_NAME_LEN
            ));
        }
        if self.summary.chars().count() > MAX_SUMMARY_LEN {
            return Err(format!("summary must be <= {} characters", MAX_SUMMARY_LEN));
        }
        if let Some(kw) = self
            .top_keywords
            .iter()
            .find(|kw| kw.chars().count() > MAX_KEYWORD_LEN)
        {
            return Err(format!(
                "keyword '{}' exceeds {} characters",
                kw, MAX_KEYWORD_LEN
            ));
        }
        Ok(())
    }
}

/// One log record as persisted to the three sinks.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: String,
    pub date_gst: String,
    pub group_name: String,
    pub summary: String,
    pub top_keywords: Vec<String>,
    pub sla_breaches: u32,
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn from_request(req: &AppendLogRequest, assigned_id: String) -> Self {
        Self {
            id: assigned_id,
            date_gst: req.date_gst.clone(),
            group_name: req.group_name.clone(),
            summary: req.summary.clone(),
            top_keywords: req.top_keywords.clone(),
            sla_breaches: req.sla_breaches,
            attachments: req.attachments.clone(),
            created_at: Utc::now(),
        }
    }
}

/// State machine for asynchronous pipeline jobs.
///
/// `Queued -> Running -> {Succeeded | Failed}`; terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// One tracked pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub result_summary: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

/// Derived daily rollup row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyKpiRow {
    pub date: String,
    pub group_name: String,
    pub logs_count: i64,
    pub total_sla_breaches: i64,
    /// Only available from the columnar rollup; the SQLite fallback
    /// aggregation cannot compute it.
    pub unique_keywords_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AppendLogRequest {
        AppendLogRequest {
            request_id: None,
            date_gst: "2025-08-09 10:00".to_string(),
            group_name: "Jopetwil 71 Group".to_string(),
            summary: "High tide paused offloading; resume at 08:00.".to_string(),
            top_keywords: vec!["High tide".to_string()],
            sla_breaches: 0,
            attachments: vec![],
            signature: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn date_pattern_is_enforced() {
        let mut req = request();
        req.date_gst = "2025-08-09T10:00".to_string();
        assert!(req.validate().is_err());
        req.date_gst = "2025-8-9 10:00".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let mut req = request();
        req.group_name = "g".repeat(MAX_GROUP_NAME_LEN + 1);
        assert!(req.validate().is_err());

        let mut req = request();
        req.summary = "s".repeat(MAX_SUMMARY_LEN + 1);
        assert!(req.validate().is_err());

        let mut req = request();
        req.top_keywords = vec!["k".repeat(MAX_KEYWORD_LEN + 1)];
        assert!(req.validate().is_err());
    }

    #[test]
    fn job_state_round_trips() {
        for s in ["queued", "running", "succeeded", "failed"] {
            assert_eq!(JobState::parse(s).unwrap().as_str(), s);
        }
        assert!(JobState::parse("cancelled").is_none());
        assert!(JobState::Succeeded.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
