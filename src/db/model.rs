//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::model::{JobStatus, TaskState};

/// Read-only job view for UI polling: aggregates plus per-task states.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub owner_id: String,
    pub account_ref: String,
    pub status: JobStatus,
    pub segments_total: i64,
    pub segments_processed: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub position: i64,
    pub name: String,
    pub state: TaskState,
    pub external_id: Option<String>,
    pub attempt_count: i64,
}

/// Current call-budget counters for one external account.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub account_ref: String,
    pub minute_window_start: DateTime<Utc>,
    pub minute_count: i64,
    pub day_date: NaiveDate,
    pub day_count: i64,
}
