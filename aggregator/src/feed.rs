//! Feed lifecycle (F). Fetch-retry logic is carried over from the
//! teacher's `ingestion.rs`; the create/discover/refresh/cron operations
//! are grounded on `workers/functions.py`'s `feed_create_and_subscribe` /
//! `scheduled_feed_refresh` orchestration and §4.F directly.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::article;
use crate::error::AppError;
use crate::models::Feed;
use crate::parser::{self, ErrorKind as ParseErrorKind};
use crate::url_normalize;

const MAX_FETCH_RETRIES: u32 = 3;

/// Fetches raw bytes from `url`, retrying transient (5xx / 429 / network)
/// failures with exponential backoff; 4xx client errors are not retried.
pub async fn fetch_feed_bytes(
    url: &str,
    request_timeout_secs: u64,
    max_size_mb: u64,
) -> Result<Vec<u8>> {
    let client = Client::builder()
        .timeout(StdDuration::from_secs(request_timeout_secs))
        .user_agent("aggregator/0.1")
        .build()
        .context("failed to build http client")?;

    let mut last_error = None;
    for attempt in 1..=MAX_FETCH_RETRIES {
        if attempt > 1 {
            let backoff = StdDuration::from_secs(2u64.pow(attempt - 2));
            tokio::time::sleep(backoff).await;
        }
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read response body")?;
                    if bytes.len() as u64 > max_size_mb * 1024 * 1024 {
                        anyhow::bail!("feed exceeds max size of {max_size_mb}MB");
                    }
                    return Ok(bytes.to_vec());
                } else if status.is_server_error() || status.as_u16() == 429 {
                    last_error = Some(anyhow::anyhow!("retryable status: {status}"));
                    continue;
                } else {
                    anyhow::bail!("feed fetch failed with status: {status}");
                }
            }
            Err(e) => last_error = Some(anyhow::Error::new(e).context("network error")),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}

/// Create feed: fetch, parse, validate, persist, and ingest entries via A.
pub async fn create_feed(pool: &PgPool, url: &str, request_timeout_secs: u64, max_size_mb: u64) -> Result<Feed, AppError> {
    let canonical_url = url_normalize::normalize(url);
    let bytes = fetch_feed_bytes(url, request_timeout_secs, max_size_mb)
        .await
        .map_err(|e| {
            warn!(%e, %url, "feed fetch failed");
            AppError::Upstream { kind: crate::error::UpstreamErrorKind::NoFeedData }
        })?;

    let (meta, entries) = parser::parse_feed(&bytes).map_err(to_upstream_error)?;

    let feed = sqlx::query_as::<_, Feed>(
        r#"
        INSERT INTO content.feeds
            (id, canonical_url, title, description, language, website, feed_type,
             last_fetched_at, last_update, error_count, is_active, latest_articles, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now(), 0, true, '[]'::jsonb, now())
        RETURNING id, canonical_url, title, description, language, website, feed_type,
                  last_fetched_at, last_update, last_error, last_error_at, error_count,
                  is_active, latest_articles, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&canonical_url)
    .bind(&meta.title)
    .bind(&meta.description)
    .bind(&meta.language)
    .bind(&meta.website)
    .bind(meta.feed_type)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;

    let outcome = article::process_entries(pool, feed.id, &entries)
        .await
        .map_err(AppError::from)?;

    let latest: Vec<Uuid> = outcome.all_fetched_article_ids.into_iter().take(200).collect();
    sqlx::query("UPDATE content.feeds SET latest_articles = $1 WHERE id = $2")
        .bind(json!(latest))
        .bind(feed.id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;

    Ok(feed)
}

fn to_upstream_error(kind: ParseErrorKind) -> AppError {
    let mapped = match kind {
        ParseErrorKind::NoFeedData => crate::error::UpstreamErrorKind::NoFeedData,
        ParseErrorKind::NoEntries => crate::error::UpstreamErrorKind::NoEntries,
        ParseErrorKind::ParsingError => crate::error::UpstreamErrorKind::ParsingError,
    };
    AppError::Upstream { kind: mapped }
}

pub enum DiscoverOutcome {
    Existing,
    Moved,
    Subscribed,
    Pending { job_id: Uuid },
}

/// Discover + subscribe (§4.F): known feed subscribes/moves directly;
/// unknown feed is deferred to a worker job, keyed by an idempotency key
/// (`create_subscribe:{user}:{url}`) so a repeated discover call while the
/// job is still pending doesn't enqueue a second one.
pub async fn discover_and_subscribe(
    pool: &PgPool,
    redis: &redis::Client,
    user_id: Uuid,
    url: &str,
    folder_id: Option<Uuid>,
) -> Result<DiscoverOutcome, AppError> {
    let canonical_url = url_normalize::normalize(url);
    let existing_feed: Option<Feed> = sqlx::query_as::<_, Feed>(
        r#"
        SELECT id, canonical_url, title, description, language, website, feed_type,
               last_fetched_at, last_update, last_error, last_error_at, error_count,
               is_active, latest_articles, created_at
        FROM content.feeds WHERE canonical_url = $1
        "#,
    )
    .bind(&canonical_url)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;

    let Some(feed) = existing_feed else {
        let idempotency_key = format!("create_subscribe:{user_id}:{url}");
        let payload = serde_json::json!({ "user_id": user_id, "url": canonical_url, "folder_id": folder_id });
        let job_id = crate::job::publish_job_idempotent(
            redis,
            "feed_create_and_subscribe",
            payload,
            Some(idempotency_key),
        )
        .await
        .map_err(AppError::from)?;
        info!(%job_id, %url, "enqueuing feed_create_and_subscribe job");
        return Ok(DiscoverOutcome::Pending { job_id });
    };

    let already_subscribed: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM personalization.subscriptions WHERE user_id = $1 AND feed_id = $2",
    )
    .bind(user_id)
    .bind(feed.id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;

    if let Some(sub_id) = already_subscribed {
        if let Some(target_folder) = folder_id {
            let folder_valid: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM personalization.folders WHERE id = $1 AND user_id = $2)",
            )
            .bind(target_folder)
            .bind(user_id)
            .fetch_one(pool)
            .await
            .map_err(AppError::from)?;
            let effective_folder = if folder_valid {
                Some(target_folder)
            } else {
                warn!(%target_folder, "invalid folder id on move; falling back to root");
                None
            };
            sqlx::query("UPDATE personalization.subscriptions SET folder_id = $1 WHERE id = $2")
                .bind(effective_folder)
                .bind(sub_id)
                .execute(pool)
                .await
                .map_err(AppError::from)?;
            return Ok(DiscoverOutcome::Moved);
        }
        return Ok(DiscoverOutcome::Existing);
    }

    subscribe_directly(pool, user_id, &feed, folder_id).await?;
    Ok(DiscoverOutcome::Subscribed)
}

async fn subscribe_directly(
    pool: &PgPool,
    user_id: Uuid,
    feed: &Feed,
    folder_id: Option<Uuid>,
) -> Result<(), AppError> {
    let sub_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO personalization.subscriptions
            (id, user_id, feed_id, folder_id, pinned, is_active, unread_count, created_at)
        VALUES ($1, $2, $3, $4, false, true, 0, now())
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(feed.id)
    .bind(folder_id)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;

    let latest_ids: Vec<Uuid> = serde_json::from_value(feed.latest_articles.clone()).unwrap_or_default();
    if !latest_ids.is_empty() {
        sqlx::query(
            r#"
            INSERT INTO personalization.user_articles (user_id, article_id, is_read, read_later, read_at)
            SELECT $1, a.id, false, false, NULL
            FROM unnest($2::uuid[]) AS a(id)
            ON CONFLICT (user_id, article_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&latest_ids)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    }

    recalculate_unread_count(pool, sub_id).await.map_err(AppError::from)?;
    Ok(())
}

pub async fn recalculate_unread_count(pool: &PgPool, subscription_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE personalization.subscriptions s
        SET unread_count = (
            SELECT count(*)
            FROM personalization.user_articles ua
            JOIN content.article_sources src ON src.article_id = ua.article_id
            WHERE ua.user_id = s.user_id AND src.feed_id = s.feed_id AND ua.is_read = false
        )
        WHERE s.id = $1
        "#,
    )
    .bind(subscription_id)
    .execute(pool)
    .await
    .context("failed to recalculate unread count")?;
    Ok(())
}

pub enum RefreshStatus {
    Success { new_articles: usize },
    Skipped,
    Error,
}

/// Refresh one feed: fetch -> parse -> A.process -> update bookkeeping.
/// Failures bump error counters rather than propagating (§4.F: feed
/// refresh errors are never fatal to the cycle).
pub async fn refresh_feed(
    pool: &PgPool,
    feed: &Feed,
    request_timeout_secs: u64,
    max_size_mb: u64,
) -> RefreshStatus {
    let bytes = match fetch_feed_bytes(&feed.canonical_url, request_timeout_secs, max_size_mb).await {
        Ok(b) => b,
        Err(e) => {
            record_feed_error(pool, feed.id, &e.to_string()).await;
            return RefreshStatus::Error;
        }
    };

    let (_, entries) = match parser::parse_feed(&bytes) {
        Ok(r) => r,
        Err(e) => {
            record_feed_error(pool, feed.id, &format!("{e:?}")).await;
            return RefreshStatus::Error;
        }
    };

    match article::process_entries(pool, feed.id, &entries).await {
        Ok(outcome) => {
            let latest: Vec<Uuid> = outcome.all_fetched_article_ids.into_iter().take(200).collect();
            let _ = sqlx::query(
                r#"
                UPDATE content.feeds
                SET last_fetched_at = now(), last_update = now(), error_count = 0,
                    last_error = NULL, last_error_at = NULL, latest_articles = $1
                WHERE id = $2
                "#,
            )
            .bind(json!(latest))
            .bind(feed.id)
            .execute(pool)
            .await;
            RefreshStatus::Success { new_articles: outcome.new_article_ids.len() }
        }
        Err(e) => {
            record_feed_error(pool, feed.id, &e.to_string()).await;
            RefreshStatus::Error
        }
    }
}

async fn record_feed_error(pool: &PgPool, feed_id: Uuid, message: &str) {
    let result = sqlx::query(
        r#"
        UPDATE content.feeds
        SET error_count = error_count + 1, last_error = $1, last_error_at = now()
        WHERE id = $2
        "#,
    )
    .bind(message)
    .bind(feed_id)
    .execute(pool)
    .await;
    if let Err(e) = result {
        error!(%e, %feed_id, "failed to record feed error");
    }
}

pub struct RefreshCycleStats {
    pub successes: usize,
    pub errors: usize,
    pub total_new_articles: usize,
}

/// Scheduled refresh cycle (cron, every 15 min): active feeds with ≥1
/// subscription, processed in batches of `batch_size`. Skipped counts as
/// success; unknown counts as failure.
pub async fn run_refresh_cycle(
    pool: &PgPool,
    batch_size: usize,
    request_timeout_secs: u64,
    max_size_mb: u64,
) -> Result<RefreshCycleStats> {
    let started = std::time::Instant::now();
    let feeds = sqlx::query_as::<_, Feed>(
        r#"
        SELECT DISTINCT f.id, f.canonical_url, f.title, f.description, f.language, f.website,
               f.feed_type, f.last_fetched_at, f.last_update, f.last_error, f.last_error_at,
               f.error_count, f.is_active, f.latest_articles, f.created_at
        FROM content.feeds f
        JOIN personalization.subscriptions s ON s.feed_id = f.id AND s.is_active = true
        WHERE f.is_active = true
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed to list feeds due for refresh")?;

    let mut stats = RefreshCycleStats { successes: 0, errors: 0, total_new_articles: 0 };

    // Each batch's feeds are refreshed concurrently (bounded by batch_size);
    // batches themselves still run one after another.
    for batch in feeds.chunks(batch_size.max(1)) {
        let mut set = tokio::task::JoinSet::new();
        for feed in batch {
            let pool = pool.clone();
            let feed = feed.clone();
            set.spawn(async move { refresh_feed(&pool, &feed, request_timeout_secs, max_size_mb).await });
        }
        while let Some(result) = set.join_next().await {
            match result {
                Ok(RefreshStatus::Success { new_articles }) => {
                    stats.successes += 1;
                    stats.total_new_articles += new_articles;
                }
                Ok(RefreshStatus::Skipped) => stats.successes += 1,
                Ok(RefreshStatus::Error) => stats.errors += 1,
                Err(e) => {
                    error!(%e, "feed refresh task panicked");
                    stats.errors += 1;
                }
            }
        }
    }

    info!(
        duration_ms = started.elapsed().as_millis() as u64,
        successes = stats.successes,
        errors = stats.errors,
        new_articles = stats.total_new_articles,
        "feed refresh cycle complete"
    );
    Ok(stats)
}

/// Mark orphaned feeds inactive (cron, 02:00 daily): one-statement update.
pub async fn mark_orphaned_feeds_inactive(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE content.feeds
        SET is_active = false
        WHERE is_active = true
          AND id NOT IN (SELECT feed_id FROM personalization.subscriptions WHERE is_active = true)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to mark orphaned feeds inactive")?;
    Ok(result.rows_affected())
}

/// Auto-mark-read sweep (cron, 03:00 daily): applies per-user cutoffs of
/// 7/14/30 days based on the `auto_mark_as_read` preference.
pub async fn run_auto_mark_read_sweep(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE personalization.user_articles ua
        SET is_read = true, read_at = now()
        FROM personalization.user_preferences p, content.articles a
        WHERE p.user_id = ua.user_id
          AND a.id = ua.article_id
          AND ua.is_read = false
          AND (p.preferences->>'auto_mark_as_read') IS NOT NULL
          AND (p.preferences->>'auto_mark_as_read') != 'disabled'
          AND a.published_at < now() - (
              CASE p.preferences->>'auto_mark_as_read'
                  WHEN '7_days' THEN interval '7 days'
                  WHEN '14_days' THEN interval '14 days'
                  WHEN '30_days' THEN interval '30 days'
              END
          )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to run auto-mark-read sweep")?;
    Ok(result.rows_affected())
}

