use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use segment_batcher::config;
use segment_batcher::db;
use segment_batcher::notify::LogSink;
use segment_batcher::platform::HttpSegmentApi;
use segment_batcher::sweep;
use segment_batcher::worker::EngineCtx;

#[derive(Debug, Parser)]
#[command(author, version, about = "Segment batch engine: sweeps and drains creation jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let tick = Duration::from_millis(cfg.app.sweep_interval_ms);
    info!(interval_ms = cfg.app.sweep_interval_ms, "starting sweep loop");

    loop {
        match sweep::run_sweep(&pool, &ctx).await {
            Ok(_) => tokio::time::sleep(tick).await,
            Err(err) => {
                error!(?err, "sweep tick failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
