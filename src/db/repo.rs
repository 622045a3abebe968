use super::model::{JobProgress, LedgerSnapshot, TaskProgress};
use crate::model::{ErrorRecord, Job, JobStatus, NewSegment, SegmentTask, TaskState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory URLs and other schemes pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path = rest.trim_start_matches("//");
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// --- job submission -------------------------------------------------------

/// Atomically insert a job and its ordered task list. The job starts
/// `pending`; nothing runs until it is claimed.
#[instrument(skip_all)]
pub async fn create_job(
    pool: &Pool,
    owner_id: &str,
    account_ref: &str,
    segments: &[NewSegment],
    max_segments: usize,
) -> Result<String> {
    if segments.is_empty() {
        return Err(anyhow!("segment list is empty"));
    }
    if segments.len() > max_segments {
        return Err(anyhow!(
            "segment list has {} entries, limit is {}",
            segments.len(),
            max_segments
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for seg in segments {
        let key = seg.name.trim().to_lowercase();
        if key.is_empty() {
            return Err(anyhow!("segment name must be non-empty"));
        }
        if !seen.insert(key) {
            return Err(anyhow!("duplicate segment name: {}", seg.name));
        }
    }

    let job_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO jobs (id, owner_id, account_ref, status, segments_total) VALUES (?, ?, ?, 'pending', ?)",
    )
    .bind(&job_id)
    .bind(owner_id)
    .bind(account_ref)
    .bind(segments.len() as i64)
    .execute(&mut *tx)
    .await?;

    for (i, seg) in segments.iter().enumerate() {
        let definition = serde_json::to_string(&seg.definition)
            .with_context(|| format!("unserializable definition for {}", seg.name))?;
        sqlx::query(
            "INSERT INTO segment_tasks (job_id, position, name, definition, state) VALUES (?, ?, ?, ?, 'pending')",
        )
        .bind(&job_id)
        .bind(i as i64 + 1)
        .bind(seg.name.trim())
        .bind(definition)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(job_id)
}

// --- job state transitions ------------------------------------------------

/// Take ownership of a job for processing. Conditional on the current status
/// so two racing sweeps cannot both win; `false` means someone else holds it
/// (or it is already terminal).
#[instrument(skip_all)]
pub async fn claim_job(pool: &Pool, job_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'in_progress', updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status IN ('pending', 'waiting_retry')",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Park an in-progress job until `resume_at`. `day_budget_date` records which
/// calendar day's allotment the job already spent when the daily window was
/// the cause.
#[instrument(skip_all)]
pub async fn park_job(
    pool: &Pool,
    job_id: &str,
    resume_at: DateTime<Utc>,
    day_budget_date: Option<NaiveDate>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'waiting_retry', next_attempt_at = ?, \
         day_budget_date = COALESCE(?, day_budget_date), updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(resume_at)
    .bind(day_budget_date)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn complete_job(pool: &Pool, job_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'completed', completed_at = CURRENT_TIMESTAMP, \
         next_attempt_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fail_job(pool: &Pool, job_id: &str, last_error: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'failed', last_error = ?, completed_at = CURRENT_TIMESTAMP, \
         next_attempt_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(last_error)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Owner-requested stop. Valid only while the job is not yet terminal; the
/// worker observes the new status at its next task boundary.
#[instrument(skip_all)]
pub async fn cancel_job(pool: &Pool, job_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', completed_at = CURRENT_TIMESTAMP, \
         next_attempt_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status IN ('pending', 'in_progress', 'waiting_retry')",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// --- job reads ------------------------------------------------------------

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status_str: String = row.get("status");
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("job has unknown status {}", status_str))?;
    Ok(Job {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        account_ref: row.get("account_ref"),
        status,
        segments_total: row.get("segments_total"),
        segments_processed: row.get("segments_processed"),
        success_count: row.get("success_count"),
        error_count: row.get("error_count"),
        last_error: row.try_get("last_error").ok(),
        next_attempt_at: row.try_get("next_attempt_at").ok(),
        day_budget_date: row.try_get("day_budget_date").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.try_get("completed_at").ok(),
    })
}

pub async fn get_job(pool: &Pool, job_id: &str) -> Result<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("job {} not found", job_id));
    };
    job_from_row(&row)
}

pub async fn job_status(pool: &Pool, job_id: &str) -> Result<JobStatus> {
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", job_id))?;
    JobStatus::parse(&status).ok_or_else(|| anyhow!("job {} has unknown status {}", job_id, status))
}

pub async fn list_jobs_for_owner(pool: &Pool, owner_id: &str) -> Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs WHERE owner_id = ? ORDER BY datetime(created_at) ASC")
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(job_from_row).collect()
}

/// Cumulative successfully created segments across all of an owner's jobs,
/// used for milestone detection.
pub async fn total_created_for_owner(pool: &Pool, owner_id: &str) -> Result<i64> {
    let total: Option<i64> =
        sqlx::query_scalar("SELECT SUM(success_count) FROM jobs WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(pool)
            .await?;
    Ok(total.unwrap_or(0))
}

// --- sweep queries --------------------------------------------------------

/// Parked jobs whose resume time has passed, oldest resume first.
#[instrument(skip_all)]
pub async fn due_waiting_jobs(pool: &Pool, limit: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM jobs WHERE status = 'waiting_retry' \
         AND next_attempt_at IS NOT NULL AND datetime(next_attempt_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(next_attempt_at) ASC, datetime(created_at) ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Jobs with no explicit resume time that have sat untouched past the settle
/// window: pending jobs orphaned by a crash before dispatch, and parked jobs
/// missing `next_attempt_at`.
#[instrument(skip_all)]
pub async fn stalled_jobs(pool: &Pool, settle_seconds: i64, limit: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM jobs \
         WHERE (status = 'pending' OR (status = 'waiting_retry' AND next_attempt_at IS NULL)) \
         AND datetime(updated_at) <= datetime('now', '-' || ? || ' seconds') \
         ORDER BY datetime(created_at) ASC LIMIT ?",
    )
    .bind(settle_seconds)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Requeue `in_progress` jobs whose worker died: a live worker touches
/// `updated_at` on every task, so a row this stale has no owner. The job
/// becomes immediately eligible again.
#[instrument(skip_all)]
pub async fn requeue_stuck_jobs(pool: &Pool, stale_seconds: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'waiting_retry', next_attempt_at = CURRENT_TIMESTAMP, \
         updated_at = CURRENT_TIMESTAMP \
         WHERE status = 'in_progress' \
         AND datetime(updated_at) <= datetime('now', '-' || ? || ' seconds')",
    )
    .bind(stale_seconds)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// --- tasks ----------------------------------------------------------------

fn task_from_row(row: &SqliteRow) -> Result<SegmentTask> {
    let state_str: String = row.get("state");
    let state = TaskState::parse(&state_str)
        .ok_or_else(|| anyhow!("task has unknown state {}", state_str))?;
    let definition_str: String = row.get("definition");
    let definition = serde_json::from_str(&definition_str)
        .with_context(|| format!("corrupt definition for task {}", row.get::<i64, _>("id")))?;
    Ok(SegmentTask {
        id: row.get("id"),
        job_id: row.get("job_id"),
        position: row.get("position"),
        name: row.get("name"),
        definition,
        state,
        external_id: row.try_get("external_id")?,
        attempt_count: row.get("attempt_count"),
    })
}

/// Tasks still needing work, in strict list order. `creating` rows are crash
/// leftovers and are retried (after the reconciler rules out a duplicate).
pub async fn open_tasks_for_job(pool: &Pool, job_id: &str) -> Result<Vec<SegmentTask>> {
    let rows = sqlx::query(
        "SELECT * FROM segment_tasks WHERE job_id = ? AND state IN ('pending', 'creating') \
         ORDER BY position ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

pub async fn tasks_for_job(pool: &Pool, job_id: &str) -> Result<Vec<SegmentTask>> {
    let rows = sqlx::query("SELECT * FROM segment_tasks WHERE job_id = ? ORDER BY position ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(task_from_row).collect()
}

/// Flag a task before its external call goes out, so a crash between the
/// call and the commit is visible on resume.
pub async fn set_task_creating(pool: &Pool, task_id: i64) -> Result<()> {
    sqlx::query("UPDATE segment_tasks SET state = 'creating' WHERE id = ? AND state = 'pending'")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn bump_task_attempt(pool: &Pool, task_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "UPDATE segment_tasks SET attempt_count = attempt_count + 1 WHERE id = ? \
         RETURNING attempt_count",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Record a successful creation: task goes terminal and the job's progress
/// counters advance, in one transaction. Guarded on the task not already
/// being terminal, which also makes replays after a crash harmless.
#[instrument(skip_all)]
pub async fn mark_task_success(
    pool: &Pool,
    job_id: &str,
    task_id: i64,
    external_id: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE segment_tasks SET state = 'success', external_id = ? \
         WHERE id = ? AND state IN ('pending', 'creating')",
    )
    .bind(external_id)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE jobs SET segments_processed = segments_processed + 1, \
         success_count = success_count + 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

/// Record a permanent task failure: task goes terminal, job counters advance,
/// and a durable error record is written for triage, in one transaction.
#[instrument(skip_all)]
pub async fn mark_task_failed(
    pool: &Pool,
    job_id: &str,
    task_id: i64,
    segment_name: &str,
    error_message: &str,
    retry_count: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE segment_tasks SET state = 'failed' WHERE id = ? AND state IN ('pending', 'creating')",
    )
    .bind(task_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE jobs SET segments_processed = segments_processed + 1, \
         error_count = error_count + 1, last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(error_message)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO error_records (job_id, segment_name, error_message, retry_count) VALUES (?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(segment_name)
    .bind(error_message)
    .bind(retry_count)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

// --- error records --------------------------------------------------------

fn error_from_row(row: &SqliteRow) -> ErrorRecord {
    ErrorRecord {
        id: row.get("id"),
        job_id: row.get("job_id"),
        segment_name: row.get("segment_name"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
        resolved_at: row.try_get("resolved_at").ok(),
    }
}

pub async fn unresolved_errors_for_job(pool: &Pool, job_id: &str) -> Result<Vec<ErrorRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM error_records WHERE job_id = ? AND resolved_at IS NULL \
         ORDER BY datetime(created_at) ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(error_from_row).collect())
}

pub async fn resolve_error(pool: &Pool, error_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE error_records SET resolved_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND resolved_at IS NULL",
    )
    .bind(error_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// --- progress view --------------------------------------------------------

pub async fn job_progress(pool: &Pool, job_id: &str) -> Result<JobProgress> {
    let job = get_job(pool, job_id).await?;
    let tasks = tasks_for_job(pool, job_id).await?;
    Ok(JobProgress {
        job_id: job.id,
        owner_id: job.owner_id,
        account_ref: job.account_ref,
        status: job.status,
        segments_total: job.segments_total,
        segments_processed: job.segments_processed,
        success_count: job.success_count,
        error_count: job.error_count,
        last_error: job.last_error,
        next_attempt_at: job.next_attempt_at,
        completed_at: job.completed_at,
        tasks: tasks
            .into_iter()
            .map(|t| TaskProgress {
                position: t.position,
                name: t.name,
                state: t.state,
                external_id: t.external_id,
                attempt_count: t.attempt_count,
            })
            .collect(),
    })
}

// --- rate ledger primitives ----------------------------------------------
// Window arithmetic lives in `pacer`; these are the raw row operations.

pub async fn ensure_ledger_row(
    pool: &Pool,
    account_ref: &str,
    now: DateTime<Utc>,
    day: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO rate_ledger (account_ref, minute_window_start, minute_count, day_date, day_count) \
         VALUES (?, ?, 0, ?, 0)",
    )
    .bind(account_ref)
    .bind(now)
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn ledger_snapshot(pool: &Pool, account_ref: &str) -> Result<Option<LedgerSnapshot>> {
    let row = sqlx::query("SELECT * FROM rate_ledger WHERE account_ref = ?")
        .bind(account_ref)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| LedgerSnapshot {
        account_ref: row.get("account_ref"),
        minute_window_start: row.get("minute_window_start"),
        minute_count: row.get("minute_count"),
        day_date: row.get("day_date"),
        day_count: row.get("day_count"),
    }))
}

/// Guarded counter update: succeeds only if the row still carries the
/// observed counters, so two racing reservations cannot both apply.
#[allow(clippy::too_many_arguments)]
pub async fn cas_update_ledger(
    pool: &Pool,
    account_ref: &str,
    new_minute_start: DateTime<Utc>,
    new_minute_count: i64,
    new_day: NaiveDate,
    new_day_count: i64,
    seen_minute_count: i64,
    seen_day_count: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE rate_ledger SET minute_window_start = ?, minute_count = ?, day_date = ?, day_count = ? \
         WHERE account_ref = ? AND minute_count = ? AND day_count = ?",
    )
    .bind(new_minute_start)
    .bind(new_minute_count)
    .bind(new_day)
    .bind(new_day_count)
    .bind(account_ref)
    .bind(seen_minute_count)
    .bind(seen_day_count)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// --- external segment cache -----------------------------------------------

/// Replace the cached remote snapshot for one account wholesale.
#[instrument(skip_all)]
pub async fn replace_segment_cache(
    pool: &Pool,
    account_ref: &str,
    entries: &[(String, String, Option<DateTime<Utc>>)],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM external_segments WHERE account_ref = ?")
        .bind(account_ref)
        .execute(&mut *tx)
        .await?;
    for (normalized_name, external_id, created_at) in entries {
        sqlx::query(
            "INSERT OR REPLACE INTO external_segments (account_ref, normalized_name, external_id, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(account_ref)
        .bind(normalized_name)
        .bind(external_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query(
        "INSERT INTO external_sync (account_ref, synced_at) VALUES (?, CURRENT_TIMESTAMP) \
         ON CONFLICT (account_ref) DO UPDATE SET synced_at = CURRENT_TIMESTAMP",
    )
    .bind(account_ref)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn cached_segment_id(
    pool: &Pool,
    account_ref: &str,
    normalized_name: &str,
) -> Result<Option<String>> {
    let id = sqlx::query_scalar(
        "SELECT external_id FROM external_segments WHERE account_ref = ? AND normalized_name = ?",
    )
    .bind(account_ref)
    .bind(normalized_name)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

pub async fn cache_synced_at(pool: &Pool, account_ref: &str) -> Result<Option<DateTime<Utc>>> {
    let at = sqlx::query_scalar("SELECT synced_at FROM external_sync WHERE account_ref = ?")
        .bind(account_ref)
        .fetch_optional(pool)
        .await?;
    Ok(at)
}
