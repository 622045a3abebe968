//! Periodic pass that reclaims eligible jobs and hands them to the worker.
//!
//! Driven externally (the service loop, the drain binary, or anything that
//! can call `run_sweep` on a timer). Claims are conditional updates, so any
//! number of concurrent sweep invocations stay safe; per-job failures are
//! isolated from the rest of the batch.

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::worker::{self, EngineCtx, RunOutcome};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub claimed: usize,
    pub completed: usize,
    pub parked: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// One sweep tick: requeue orphans, claim up to `limits.sweep_batch` eligible
/// jobs, run each through the worker.
#[instrument(skip_all)]
pub async fn run_sweep(pool: &Pool, ctx: &EngineCtx<'_>) -> Result<SweepStats> {
    let requeued = db::requeue_stuck_jobs(pool, ctx.settle_seconds).await?;
    if requeued > 0 {
        warn!(requeued, "requeued jobs from dead workers");
    }

    let limit = ctx.limits.sweep_batch;
    let mut ids = db::due_waiting_jobs(pool, limit).await?;
    if (ids.len() as i64) < limit {
        let remaining = limit - ids.len() as i64;
        for id in db::stalled_jobs(pool, ctx.settle_seconds, remaining).await? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    let mut stats = SweepStats::default();
    for job_id in ids {
        match dispatch_job(pool, ctx, &job_id).await {
            Ok(Some(outcome)) => {
                stats.claimed += 1;
                match outcome {
                    RunOutcome::Completed => stats.completed += 1,
                    RunOutcome::Parked(_) => stats.parked += 1,
                    RunOutcome::Failed => stats.failed += 1,
                    RunOutcome::Cancelled => stats.cancelled += 1,
                }
            }
            // Another sweep got there first.
            Ok(None) => {}
            Err(err) => {
                error!(?err, job_id = %job_id, "sweep dispatch failed");
            }
        }
    }
    if stats.claimed > 0 {
        info!(
            claimed = stats.claimed,
            completed = stats.completed,
            parked = stats.parked,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "sweep finished"
        );
    }
    Ok(stats)
}

/// Claim one specific job and run it. `None` means the claim was lost (the
/// job is owned elsewhere or already terminal). Used both by the sweep and
/// as the immediate path right after submission.
pub async fn dispatch_job(
    pool: &Pool,
    ctx: &EngineCtx<'_>,
    job_id: &str,
) -> Result<Option<RunOutcome>> {
    if !db::claim_job(pool, job_id).await? {
        return Ok(None);
    }
    let outcome = worker::run_claimed_job(pool, ctx, job_id).await?;
    Ok(Some(outcome))
}
