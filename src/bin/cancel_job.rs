use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use segment_batcher::config;
use segment_batcher::db;
use segment_batcher::notify::LogSink;
use segment_batcher::worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Request cancellation of a job")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Job to cancel
    #[arg(long)]
    job: String,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/segment_batcher.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if worker::request_cancel(&pool, &LogSink, &args.job).await? {
        println!("cancelled {}", args.job);
    } else {
        println!("{} is already terminal; nothing to cancel", args.job);
    }
    Ok(())
}
