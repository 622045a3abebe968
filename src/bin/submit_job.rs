use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use segment_batcher::config;
use segment_batcher::db;
use segment_batcher::model::NewSegment;
use segment_batcher::notify::LogSink;
use segment_batcher::platform::HttpSegmentApi;
use segment_batcher::sweep;
use segment_batcher::worker::EngineCtx;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Submit a batch of segment definitions as a new job and start it"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Owner requesting the batch
    #[arg(long)]
    owner: String,

    /// External platform account the segments are created under
    #[arg(long)]
    account: String,

    /// JSON file: [{"name": "...", "definition": {...}}, ...]
    #[arg(long)]
    segments: PathBuf,

    /// Insert the job but skip the immediate first run (the sweep loop will
    /// pick it up)
    #[arg(long)]
    no_dispatch: bool,
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

    let raw = tokio::fs::read_to_string(&args.segments)
        .await
        .with_context(|| format!("failed to read {}", args.segments.display()))?;
    let segments: Vec<NewSegment> =
        serde_json::from_str(&raw).context("segments file must be a JSON array")?;

    let job_id = db::create_job(
        &pool,
        &args.owner,
        &args.account,
        &segments,
        cfg.limits.max_segments_per_job,
    )
    .await?;
    println!("{}", job_id);

    if args.no_dispatch {
        return Ok(());
    }

    let api = HttpSegmentApi::from_config(&cfg)?;
    let sink = LogSink;
    let ctx = EngineCtx::new(&api, &sink, &cfg);
    match sweep::dispatch_job(&pool, &ctx, &job_id).await? {
        Some(outcome) => info!(?outcome, job_id = %job_id, "initial run finished"),
        None => info!(job_id = %job_id, "job picked up elsewhere"),
    }
    Ok(())
}
