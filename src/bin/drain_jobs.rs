use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use segment_batcher::config;
use segment_batcher::db;
use segment_batcher::notify::LogSink;
use segment_batcher::platform::HttpSegmentApi;
use segment_batcher::sweep;
use segment_batcher::worker::EngineCtx;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run sweeps until every eligible job is drained, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit as soon as the only remaining jobs are parked in the future
    /// (default waits for short minute-window parks to elapse)
    #[arg(long)]
    no_wait: bool,

    /// Longest pause worth sitting through before giving up and exiting,
    /// in seconds
    #[arg(long, default_value = "120")]
    max_wait_secs: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/segment_batcher.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let api = HttpSegmentApi::from_config(&cfg)?;
    let sink = LogSink;
    let ctx = EngineCtx::new(&api, &sink, &cfg);

    let mut total_claimed = 0usize;
    loop {
        let stats = sweep::run_sweep(&pool, &ctx).await?;
        total_claimed += stats.claimed;
        if stats.claimed > 0 {
            info!(total_claimed, "drain progress");
            continue;
        }

        // Nothing was claimable. Decide whether anything is still coming.
        let next_due: Option<String> = sqlx::query_scalar(
            "SELECT MIN(datetime(next_attempt_at)) FROM jobs WHERE status = 'waiting_retry'",
        )
        .fetch_one(&pool)
        .await?;
        let open_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'in_progress', 'waiting_retry')",
        )
        .fetch_one(&pool)
        .await?;

        if open_count == 0 {
            info!(total_claimed, "all jobs drained");
            return Ok(());
        }
        let Some(next_due) = next_due else {
            // Open jobs but nothing scheduled: either owned by another
            // process or waiting out the settle window.
            warn!(open_count, "open jobs without a resume time; waiting for settle");
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            continue;
        };
        if args.no_wait {
            info!(open_count, %next_due, "jobs parked in the future; exiting (--no-wait)");
            return Ok(());
        }

        let wait: Option<i64> = sqlx::query_scalar(
            "SELECT CAST((julianday(MIN(datetime(next_attempt_at))) - julianday('now')) * 86400 AS INTEGER) \
             FROM jobs WHERE status = 'waiting_retry'",
        )
        .fetch_one(&pool)
        .await?;
        let wait = wait.unwrap_or(0).max(1);
        if wait > args.max_wait_secs {
            info!(
                open_count,
                %next_due,
                "next resume is {}s away (limit {}s); exiting",
                wait,
                args.max_wait_secs
            );
            return Ok(());
        }
        info!(open_count, "sleeping {}s until next resume", wait);
        tokio::time::sleep(std::time::Duration::from_secs(wait as u64)).await;
    }
}
