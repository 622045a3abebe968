use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use segment_batcher::config;
use segment_batcher::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect job progress and account budgets")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print one job (aggregates plus per-task states) as JSON
    #[arg(long)]
    job: Option<String>,

    /// List an owner's jobs as JSON
    #[arg(long)]
    owner: Option<String>,

    /// Print the current call-budget counters for an account
    #[arg(long)]
    account: Option<String>,

    /// Include unresolved error records with --job
    #[arg(long)]
    errors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/segment_batcher.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if let Some(job_id) = &args.job {
        let progress = db::job_progress(&pool, job_id).await?;
        println!("{}", serde_json::to_string_pretty(&progress)?);
        if args.errors {
            let errors = db::unresolved_errors_for_job(&pool, job_id).await?;
            println!("{}", serde_json::to_string_pretty(&errors)?);
        }
        return Ok(());
    }

    if let Some(owner) = &args.owner {
        let jobs = db::list_jobs_for_owner(&pool, owner).await?;
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        let total = db::total_created_for_owner(&pool, owner).await?;
        eprintln!("total segments created: {}", total);
        return Ok(());
    }

    if let Some(account) = &args.account {
        match db::ledger_snapshot(&pool, account).await? {
            Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            None => eprintln!("no calls recorded for {}", account),
        }
        return Ok(());
    }

    eprintln!("pass one of --job, --owner, --account");
    Ok(())
}
