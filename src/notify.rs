//! Terminal-transition events for external collaborators.
//!
//! The engine only emits; formatting and delivery (email, digests, UI
//! refresh) belong to whatever sits behind the sink.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::model::JobStatus;

/// Cumulative created-segment counts at which owners get a milestone nudge.
pub const MILESTONES: [i64; 5] = [100, 500, 1000, 5000, 10000];

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcomeEvent {
    pub job_id: String,
    pub owner_id: String,
    pub status: JobStatus,
    pub success_count: i64,
    pub error_count: i64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneEvent {
    pub owner_id: String,
    pub total_created: i64,
    pub threshold: i64,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn job_finished(&self, event: &JobOutcomeEvent) -> Result<()>;
    async fn milestone_reached(&self, event: &MilestoneEvent) -> Result<()>;
}

/// Default sink: structured log lines that downstream collectors pick up.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn job_finished(&self, event: &JobOutcomeEvent) -> Result<()> {
        info!(
            job_id = %event.job_id,
            owner_id = %event.owner_id,
            status = event.status.as_str(),
            success = event.success_count,
            errors = event.error_count,
            "job finished"
        );
        Ok(())
    }

    async fn milestone_reached(&self, event: &MilestoneEvent) -> Result<()> {
        info!(
            owner_id = %event.owner_id,
            total = event.total_created,
            threshold = event.threshold,
            "segment milestone reached"
        );
        Ok(())
    }
}

/// Milestone thresholds crossed when an owner's total moves from `prev` to
/// `current`.
pub fn crossed_milestones(prev: i64, current: i64) -> Vec<i64> {
    MILESTONES
        .iter()
        .copied()
        .filter(|t| prev < *t && *t <= current)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_detects_thresholds() {
        assert_eq!(crossed_milestones(90, 110), vec![100]);
        assert_eq!(crossed_milestones(0, 600), vec![100, 500]);
        assert_eq!(crossed_milestones(100, 100), Vec::<i64>::new());
        assert_eq!(crossed_milestones(100, 101), Vec::<i64>::new());
        assert_eq!(crossed_milestones(99, 100), vec![100]);
    }

    #[test]
    fn no_crossing_without_progress() {
        assert!(crossed_milestones(50, 50).is_empty());
        assert!(crossed_milestones(150, 499).is_empty());
    }
}
