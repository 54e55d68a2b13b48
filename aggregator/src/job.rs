//! Job runtime (J): publisher, worker functions, cron table, status
//! tracker. Grounded on `workers/functions.py` (worker function shapes)
//! and the teacher's `processing.rs` job-tracking pattern, re-targeted
//! from a SQL jobs table to Redis (Q) per §4.J.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::models::{JobRecord, JobStatus};

pub const JOB_TTL_SECONDS: u64 = 3600;
pub const JOB_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_TRIES: u32 = 3;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 10;
const QUEUE_KEY: &str = "aggregator:jobs:queue";

fn job_key(id: Uuid) -> String {
    format!("job:{id}")
}

fn idempotency_key(key: &str) -> String {
    format!("aggregator:jobs:idempotent:{key}")
}

fn notification_channel(user_id: Uuid) -> String {
    format!("aggregator:notifications:{user_id}")
}

/// Publisher: constructs a JobRecord with TTL `JOB_TTL`, status pending,
/// then enqueues the job id on Q's list. Returns `{job_id}`.
pub async fn publish_job(redis: &redis::Client, job_type: &str, payload: Value) -> Result<Uuid> {
    publish_job_idempotent(redis, job_type, payload, None).await
}

/// Same as `publish_job`, but when `idempotency_key` is `Some`, a second
/// call with the same key returns the already-queued job's id instead of
/// enqueuing a duplicate (§4.F's `create_subscribe:{user}:{url}` key).
pub async fn publish_job_idempotent(
    redis: &redis::Client,
    job_type: &str,
    payload: Value,
    idempotency_key: Option<String>,
) -> Result<Uuid> {
    let mut conn = redis.get_async_connection().await.context("failed to connect to redis")?;

    if let Some(key) = &idempotency_key {
        let existing: Option<String> = conn
            .get(self::idempotency_key(key))
            .await
            .context("failed to check idempotency key")?;
        if let Some(existing_id) = existing.and_then(|s| Uuid::parse_str(&s).ok()) {
            return Ok(existing_id);
        }
    }

    let record = JobRecord {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        status: JobStatus::Pending,
        payload,
        result: None,
        error: None,
        created_at: Utc::now(),
        completed_at: None,
        tries: 0,
    };
    let serialized = serde_json::to_string(&record).context("failed to serialize job record")?;
    let _: () = conn
        .set_ex(job_key(record.id), serialized, JOB_TTL_SECONDS)
        .await
        .context("failed to store job record")?;
    let _: () = conn
        .rpush(QUEUE_KEY, record.id.to_string())
        .await
        .context("failed to enqueue job")?;

    if let Some(key) = &idempotency_key {
        let _: () = conn
            .set_ex(self::idempotency_key(key), record.id.to_string(), JOB_TTL_SECONDS)
            .await
            .context("failed to store idempotency key")?;
    }

    Ok(record.id)
}

/// Publishes `title|action|message` on the user's notification channel
/// (§4.F). Best-effort: callers log and move on rather than fail the job
/// over a notification that couldn't be delivered.
pub async fn notify_user(redis: &redis::Client, user_id: Uuid, title: &str, action: &str, message: &str) -> Result<()> {
    let mut conn = redis.get_async_connection().await.context("failed to connect to redis")?;
    let _: () = conn
        .publish(notification_channel(user_id), format!("{title}|{action}|{message}"))
        .await
        .context("failed to publish notification")?;
    Ok(())
}

pub async fn get_job(redis: &redis::Client, job_id: Uuid) -> Result<Option<JobRecord>> {
    let mut conn = redis.get_async_connection().await.context("failed to connect to redis")?;
    let raw: Option<String> = conn.get(job_key(job_id)).await.context("failed to fetch job record")?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s).context("failed to deserialize job record")?)),
        None => Ok(None),
    }
}

/// TTL reset on every update, per §4.J status tracker contract.
pub async fn update_job(redis: &redis::Client, mut record: JobRecord) -> Result<()> {
    let mut conn = redis.get_async_connection().await.context("failed to connect to redis")?;
    if matches!(record.status, JobStatus::Completed | JobStatus::Failed) {
        record.completed_at = Some(Utc::now());
    }
    let serialized = serde_json::to_string(&record).context("failed to serialize job record")?;
    let _: () = conn
        .set_ex(job_key(record.id), serialized, JOB_TTL_SECONDS)
        .await
        .context("failed to update job record")?;
    Ok(())
}

/// Blocks (with a short timeout) for the next queued job id. Returns
/// `None` on an empty queue so the caller's poll loop can yield.
pub async fn dequeue_job(redis: &redis::Client, poll_timeout_secs: f64) -> Result<Option<Uuid>> {
    let mut conn = redis.get_async_connection().await.context("failed to connect to redis")?;
    let result: Option<(String, String)> = conn
        .blpop(QUEUE_KEY, poll_timeout_secs)
        .await
        .context("failed to dequeue job")?;
    Ok(result.and_then(|(_, id)| Uuid::parse_str(&id).ok()))
}

/// Worker functions each run under their own transaction (commit on
/// success, rollback on exception), update the JobRecord, and return
/// whether to publish a user notification.
pub async fn run_job(pool: &PgPool, redis: &redis::Client, job_id: Uuid) -> Result<()> {
    let Some(mut record) = get_job(redis, job_id).await? else {
        return Ok(());
    };
    record.status = JobStatus::Running;
    record.tries += 1;
    update_job(redis, record.clone()).await?;

    let outcome = dispatch(pool, &record).await;
    match outcome {
        Ok(result) => {
            if record.job_type == "feed_create_and_subscribe" {
                notify_discovery_result(redis, &record.payload, Ok(&result)).await;
            }
            record.status = JobStatus::Completed;
            record.result = Some(result);
            record.error = None;
        }
        Err(e) => {
            if record.job_type == "feed_create_and_subscribe" {
                notify_discovery_result(redis, &record.payload, Err(&e)).await;
            }
            if record.tries < DEFAULT_MAX_TRIES {
                record.status = JobStatus::Pending;
            } else {
                record.status = JobStatus::Failed;
            }
            record.error = Some(e.to_string());
        }
    }
    update_job(redis, record).await?;
    Ok(())
}

/// Notifies the requesting user of a `feed_create_and_subscribe` job's
/// outcome, matching the original worker's `discovery_subscription_success`
/// / `discovery_subscription_failed` events.
async fn notify_discovery_result(redis: &redis::Client, payload: &Value, outcome: Result<&Value, &anyhow::Error>) {
    let Some(user_id) = payload
        .get("user_id")
        .and_then(|v| serde_json::from_value::<Uuid>(v.clone()).ok())
    else {
        return;
    };
    let url = payload.get("url").and_then(|v| v.as_str()).unwrap_or_default();

    let (title, action, message) = match outcome {
        Ok(result) => {
            let title = result.get("title").and_then(|v| v.as_str()).unwrap_or(url).to_string();
            (title, "subscribed", "Subscribed successfully".to_string())
        }
        Err(e) => (url.to_string(), "failed", e.to_string()),
    };

    if let Err(err) = notify_user(redis, user_id, &title, action, &message).await {
        warn!(error = %err, %user_id, "failed to publish discovery notification");
    }
}

async fn dispatch(pool: &PgPool, record: &JobRecord) -> Result<Value> {
    match record.job_type.as_str() {
        "feed_create_and_subscribe" => feed_create_and_subscribe(pool, &record.payload).await,
        "opml_import" => opml_import(pool, &record.payload).await,
        "opml_export" => opml_export(pool, &record.payload).await,
        "scheduled_feed_refresh" => scheduled_feed_refresh(pool, &record.payload).await,
        "scheduled_feed_cleanup" => scheduled_feed_cleanup(pool).await,
        "scheduled_auto_mark_read" => scheduled_auto_mark_read(pool).await,
        other => anyhow::bail!("unknown job type: {other}"),
    }
}

async fn feed_create_and_subscribe(pool: &PgPool, payload: &Value) -> Result<Value> {
    let user_id: Uuid = serde_json::from_value(payload["user_id"].clone())?;
    let url = payload["url"].as_str().context("missing url in payload")?;
    let folder_id: Option<Uuid> = payload.get("folder_id").and_then(|v| serde_json::from_value(v.clone()).ok());

    let feed = crate::feed::create_feed(pool, url, 30, 5)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    sqlx::query(
        r#"
        INSERT INTO personalization.subscriptions
            (id, user_id, feed_id, folder_id, pinned, is_active, unread_count, created_at)
        VALUES ($1, $2, $3, $4, false, true, 0, now())
        ON CONFLICT (user_id, feed_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(feed.id)
    .bind(folder_id)
    .execute(pool)
    .await?;

    Ok(serde_json::json!({ "feed_id": feed.id, "title": feed.title }))
}

async fn opml_import(pool: &PgPool, payload: &Value) -> Result<Value> {
    let user_id: Uuid = serde_json::from_value(payload["user_id"].clone())?;
    let import_id: Uuid = serde_json::from_value(payload["import_id"].clone())?;
    let contents = payload["contents"].as_str().context("missing contents")?;
    let outlines = crate::opml::validate_opml_upload(
        payload["filename"].as_str().unwrap_or("import.opml"),
        contents,
        16 * 1024 * 1024,
        9,
        10_000,
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    crate::opml::run_import(pool, user_id, import_id, &outlines).await?;
    Ok(serde_json::json!({ "import_id": import_id }))
}

async fn opml_export(pool: &PgPool, payload: &Value) -> Result<Value> {
    let user_id: Uuid = serde_json::from_value(payload["user_id"].clone())?;
    let content = crate::opml::generate_export(pool, user_id).await?;
    Ok(serde_json::json!({ "bytes": content.len() }))
}

async fn scheduled_feed_refresh(pool: &PgPool, payload: &Value) -> Result<Value> {
    let batch_size = payload.get("batch_size").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
    let stats = crate::feed::run_refresh_cycle(pool, batch_size, 30, 5).await?;
    Ok(serde_json::json!({
        "successes": stats.successes,
        "errors": stats.errors,
        "new_articles": stats.total_new_articles,
    }))
}

async fn scheduled_feed_cleanup(pool: &PgPool) -> Result<Value> {
    let removed = crate::feed::mark_orphaned_feeds_inactive(pool).await?;
    Ok(serde_json::json!({ "deactivated": removed }))
}

async fn scheduled_auto_mark_read(pool: &PgPool) -> Result<Value> {
    let affected = crate::feed::run_auto_mark_read_sweep(pool).await?;
    Ok(serde_json::json!({ "marked_read": affected }))
}

/// The three entries of §6.5; jobs are not unique and do not run at
/// startup. The worker loop schedules these by wall-clock time rather
/// than a fixed-interval `tokio::time::interval` so that restarts don't
/// drift the daily jobs' time-of-day.
pub struct CronEntry {
    pub job_type: &'static str,
    pub due: fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool,
}

pub const CRON_TABLE: &[CronEntry] = &[
    CronEntry { job_type: "scheduled_feed_refresh", due: due_every_15_minutes },
    CronEntry { job_type: "scheduled_feed_cleanup", due: due_daily_at_02 },
    CronEntry { job_type: "scheduled_auto_mark_read", due: due_daily_at_03 },
];

fn due_every_15_minutes(last_run: Utc_, now: Utc_) -> bool {
    now.signed_duration_since(last_run) >= chrono::Duration::minutes(15)
}
type Utc_ = chrono::DateTime<Utc>;

fn due_daily_at_02(last_run: Utc_, now: Utc_) -> bool {
    due_daily_at(last_run, now, 2)
}

fn due_daily_at_03(last_run: Utc_, now: Utc_) -> bool {
    due_daily_at(last_run, now, 3)
}

fn due_daily_at(last_run: Utc_, now: Utc_, hour: u32) -> bool {
    use chrono::Timelike;
    now.hour() == hour && now.signed_duration_since(last_run) >= chrono::Duration::hours(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn refresh_cadence_is_fifteen_minutes() {
        let last = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let not_due = Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap();
        let due = Utc.with_ymd_and_hms(2026, 1, 1, 0, 16, 0).unwrap();
        assert!(!due_every_15_minutes(last, not_due));
        assert!(due_every_15_minutes(last, due));
    }

    #[test]
    fn daily_job_fires_once_in_its_hour() {
        let last = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let at_two = Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap();
        assert!(due_daily_at_02(last, at_two));
    }
}
