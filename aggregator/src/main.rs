/*
aggregator - single-binary main.rs
Starts the Rocket HTTP server and runs the background job worker inside
the same process (§4.J). The worker half polls the Redis job queue and
runs the cron table; either half can be disabled via CLI flags.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::{init_db_pool, Config};
use std::path::PathBuf;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use aggregator::job;
use aggregator::server::{self, launch_rocket};

#[derive(Parser, Debug)]
#[command(name = "aggregator", about = "Self-hosted feed aggregator: server + worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable background worker (run server only)
    #[arg(long)]
    no_worker: bool,

    /// Run worker only (do not bind HTTP server)
    #[arg(long)]
    worker_only: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = match &args.config {
        Some(p) => {
            if !p.exists() {
                error!(path = ?p, "specified config file not found");
                anyhow::bail!("config file not found: {}", p.display());
            }
            Some(p.clone())
        }
        None => {
            let p = PathBuf::from("config.toml");
            p.exists().then_some(p)
        }
    };
    let config = Config::load_with_defaults(
        default_path.exists().then_some(default_path.as_path()),
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;

    let db = init_db_pool(&config.database).await.context("failed to connect to the database")?;
    server::ensure_schema(&db).await.context("failed to run migrations")?;

    let redis = redis::Client::open(config.redis.url.clone()).context("invalid redis URL")?;

    if args.worker_only {
        info!("starting in worker-only mode");
        run_worker(db, redis, config).await?;
        return Ok(());
    }

    if args.no_worker {
        info!("starting in server-only mode");
        return launch_rocket(db, redis, config).await;
    }

    info!("starting server + worker in a single process");
    let shutdown = std::sync::Arc::new(Notify::new());
    let worker_shutdown = shutdown.clone();
    let worker_db = db.clone();
    let worker_redis = redis.clone();
    let worker_config = config.clone();

    let worker_handle = tokio::spawn(async move {
        select! {
            result = run_worker(worker_db, worker_redis, worker_config) => {
                if let Err(e) = result {
                    error!(error = %e, "worker loop exited with an error");
                }
            }
            _ = worker_shutdown.notified() => {
                info!("worker loop shutting down");
            }
        }
    });

    let server_result = launch_rocket(db, redis, config).await;
    shutdown.notify_one();
    let _ = worker_handle.await;
    server_result
}

/// Background worker: dequeues jobs published by the HTTP server and runs
/// the cron table's scheduled jobs on their own cadence (§4.J). Runs until
/// the process is killed; `select!` lets the server half signal shutdown
/// via `Notify` when it's torn down first. The number of jobs running at
/// once is bounded by `jobs.max_concurrent_jobs` (default
/// `job::DEFAULT_MAX_CONCURRENT_JOBS`) so a queue backlog can't spawn an
/// unbounded number of concurrent DB connections.
async fn run_worker(db: sqlx::PgPool, redis: redis::Client, config: Config) -> Result<()> {
    let max_concurrent = config
        .jobs
        .as_ref()
        .map(|j| j.max_concurrent_jobs())
        .unwrap_or(job::DEFAULT_MAX_CONCURRENT_JOBS)
        .max(1);
    let mut last_run: std::collections::HashMap<&'static str, chrono::DateTime<Utc>> =
        job::CRON_TABLE.iter().map(|entry| (entry.job_type, Utc::now())).collect();
    let mut running = tokio::task::JoinSet::new();

    loop {
        if running.len() >= max_concurrent {
            if let Some(result) = running.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "job task panicked");
                }
            }
        }

        match job::dequeue_job(&redis, 1.0).await {
            Ok(Some(job_id)) => {
                let db = db.clone();
                let redis = redis.clone();
                running.spawn(async move {
                    if let Err(e) = job::run_job(&db, &redis, job_id).await {
                        error!(job_id = %job_id, error = %e, "job failed");
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to dequeue job, backing off");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        let now = Utc::now();
        for entry in job::CRON_TABLE {
            let due = last_run.get(entry.job_type).map(|prev| (entry.due)(*prev, now)).unwrap_or(true);
            if due {
                match job::publish_job(&redis, entry.job_type, serde_json::json!({})).await {
                    Ok(_) => {
                        last_run.insert(entry.job_type, now);
                    }
                    Err(e) => error!(job_type = entry.job_type, error = %e, "failed to schedule cron job"),
                }
            }
        }
    }
}
