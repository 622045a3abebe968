//! Drains one claimed job's task list against the external platform.
//!
//! The worker never blocks across a quota wait: a pacer denial persists the
//! job as `waiting_retry` with a concrete resume time and returns, and the
//! sweep picks it up later. Cancellation is cooperative, observed at task
//! boundaries; an in-flight call finishes and its result is still recorded.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::{App, Config, Limits};
use crate::db::{self, Pool};
use crate::model::JobStatus;
use crate::notify::{self, JobOutcomeEvent, MilestoneEvent, NotificationSink};
use crate::pacer::{Decision, DeniedWindow, Pacer};
use crate::platform::{ApiError, SegmentApi};
use crate::reconciler;

/// Shared collaborators threaded through the worker and sweep.
pub struct EngineCtx<'a> {
    pub api: &'a dyn SegmentApi,
    pub sink: &'a dyn NotificationSink,
    pub pacer: Pacer,
    pub limits: Limits,
    pub branding_suffix: String,
    pub settle_seconds: i64,
}

impl<'a> EngineCtx<'a> {
    pub fn new(api: &'a dyn SegmentApi, sink: &'a dyn NotificationSink, cfg: &Config) -> Self {
        Self::with_parts(api, sink, &cfg.limits, &cfg.app, &cfg.platform.branding_suffix)
    }

    pub fn with_parts(
        api: &'a dyn SegmentApi,
        sink: &'a dyn NotificationSink,
        limits: &Limits,
        app: &App,
        branding_suffix: &str,
    ) -> Self {
        Self {
            api,
            sink,
            pacer: Pacer::from_limits(limits),
            limits: limits.clone(),
            branding_suffix: branding_suffix.to_string(),
            settle_seconds: app.settle_seconds as i64,
        }
    }
}

/// How a single worker pass over a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Parked(DateTime<Utc>),
    Failed,
    Cancelled,
}

enum TaskOutcome {
    Created(String),
    Rejected(String),
    Exhausted(String),
    CredentialFailure(String),
    Quota {
        resume_at: DateTime<Utc>,
        window: DeniedWindow,
    },
}

/// Process a job the caller has already claimed (`in_progress`).
#[instrument(skip_all)]
pub async fn run_claimed_job(pool: &Pool, ctx: &EngineCtx<'_>, job_id: &str) -> Result<RunOutcome> {
    let job = db::get_job(pool, job_id).await?;

    // Refresh the duplicate-detection snapshot when it has gone stale. A
    // failed refresh is non-fatal; we run against the previous snapshot.
    if reconciler::is_stale(pool, &job.account_ref, ctx.limits.cache_max_age_seconds).await? {
        if let Err(err) =
            reconciler::sync(pool, ctx.api, &job.account_ref, &ctx.branding_suffix).await
        {
            warn!(?err, "remote cache refresh failed; using stale cache");
        }
    }

    let tasks = db::open_tasks_for_job(pool, job_id).await?;
    let mut consecutive_failures: i64 = 0;

    for task in tasks {
        // Cooperative cancellation, once per task boundary.
        if db::job_status(pool, job_id).await? == JobStatus::Cancelled {
            info!("cancellation observed; leaving remaining tasks pending");
            return Ok(RunOutcome::Cancelled);
        }

        // Idempotent skip: the segment already exists remotely (earlier run,
        // crash between call and commit, or concurrent tooling). No quota
        // is spent.
        if let Some(external_id) =
            reconciler::lookup(pool, &job.account_ref, &task.name, &ctx.branding_suffix).await?
        {
            info!(segment = %task.name, %external_id, "segment already exists; skipping creation");
            db::mark_task_success(pool, job_id, task.id, &external_id).await?;
            consecutive_failures = 0;
            continue;
        }

        let mut attempts = task.attempt_count;
        let outcome = loop {
            match ctx
                .pacer
                .try_reserve(pool, &job.account_ref, Utc::now())
                .await?
            {
                Decision::Denied { resume_at, window } => {
                    break TaskOutcome::Quota { resume_at, window }
                }
                Decision::Allowed => {}
            }

            db::set_task_creating(pool, task.id).await?;
            attempts = db::bump_task_attempt(pool, task.id).await?;

            match ctx
                .api
                .create_segment(&job.account_ref, &task.name, &task.definition)
                .await
            {
                Ok(created) => break TaskOutcome::Created(created.external_id),
                Err(ApiError::Validation(msg)) => break TaskOutcome::Rejected(msg),
                Err(ApiError::Credential(msg)) => break TaskOutcome::CredentialFailure(msg),
                Err(ApiError::Transient(msg)) => {
                    if attempts >= ctx.limits.task_attempt_limit {
                        break TaskOutcome::Exhausted(msg);
                    }
                    warn!(segment = %task.name, attempts, ?msg, "transient failure; retrying");
                    tokio::time::sleep(retry_backoff(attempts)).await;
                }
            }
        };

        match outcome {
            TaskOutcome::Created(external_id) => {
                db::mark_task_success(pool, job_id, task.id, &external_id).await?;
                consecutive_failures = 0;
            }
            TaskOutcome::Rejected(msg) | TaskOutcome::Exhausted(msg) => {
                db::mark_task_failed(pool, job_id, task.id, &task.name, &msg, attempts).await?;
                consecutive_failures += 1;
                if consecutive_failures >= ctx.limits.consecutive_failure_limit {
                    let reason = format!(
                        "aborted after {} consecutive task failures (last: {})",
                        consecutive_failures, msg
                    );
                    warn!(%reason, "job aborted");
                    if db::fail_job(pool, job_id, &reason).await? {
                        emit_outcome(pool, ctx.sink, job_id).await?;
                    }
                    return Ok(RunOutcome::Failed);
                }
            }
            TaskOutcome::CredentialFailure(msg) => {
                warn!(?msg, "credential rejected; aborting job");
                if db::fail_job(pool, job_id, &msg).await? {
                    emit_outcome(pool, ctx.sink, job_id).await?;
                }
                return Ok(RunOutcome::Failed);
            }
            TaskOutcome::Quota { resume_at, window } => {
                let day_budget_date =
                    (window == DeniedWindow::Day).then(|| Utc::now().date_naive());
                info!(%resume_at, ?window, "quota exhausted; parking job");
                if db::park_job(pool, job_id, resume_at, day_budget_date).await? {
                    return Ok(RunOutcome::Parked(resume_at));
                }
                // The park lost to a concurrent cancellation.
                return Ok(RunOutcome::Cancelled);
            }
        }
    }

    if db::complete_job(pool, job_id).await? {
        emit_outcome(pool, ctx.sink, job_id).await?;
        emit_milestones(pool, ctx.sink, job_id).await?;
        Ok(RunOutcome::Completed)
    } else {
        // Cancellation won at the finish line.
        Ok(RunOutcome::Cancelled)
    }
}

/// Owner-facing cancellation entry point. Returns false when the job was
/// already terminal.
#[instrument(skip_all)]
pub async fn request_cancel(
    pool: &Pool,
    sink: &dyn NotificationSink,
    job_id: &str,
) -> Result<bool> {
    if db::cancel_job(pool, job_id).await? {
        emit_outcome(pool, sink, job_id).await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn retry_backoff(attempts: i64) -> Duration {
    // 250ms * 2^n, capped at 5s. Quota waits never come through here.
    let exp = attempts.clamp(0, 5) as u32;
    Duration::from_millis((250u64 << exp).min(5_000))
}

async fn emit_outcome(pool: &Pool, sink: &dyn NotificationSink, job_id: &str) -> Result<()> {
    let job = db::get_job(pool, job_id).await?;
    let event = JobOutcomeEvent {
        job_id: job.id,
        owner_id: job.owner_id,
        status: job.status,
        success_count: job.success_count,
        error_count: job.error_count,
        completed_at: job.completed_at,
    };
    // Sink trouble must not disturb job state.
    if let Err(err) = sink.job_finished(&event).await {
        warn!(?err, "notification sink rejected job outcome");
    }
    Ok(())
}

async fn emit_milestones(pool: &Pool, sink: &dyn NotificationSink, job_id: &str) -> Result<()> {
    let job = db::get_job(pool, job_id).await?;
    let total = db::total_created_for_owner(pool, &job.owner_id).await?;
    let prev = total - job.success_count;
    for threshold in notify::crossed_milestones(prev, total) {
        let event = MilestoneEvent {
            owner_id: job.owner_id.clone(),
            total_created: total,
            threshold,
        };
        if let Err(err) = sink.milestone_reached(&event).await {
            warn!(?err, "notification sink rejected milestone");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_millis(250));
        assert_eq!(retry_backoff(1), Duration::from_millis(500));
        assert_eq!(retry_backoff(2), Duration::from_millis(1000));
        assert_eq!(retry_backoff(50), Duration::from_millis(5000));
    }
}
