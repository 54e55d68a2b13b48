//! Article processor (A). Grounded on
//! `infrastructure/feed/processing/article_processor.py`: partition
//! pre-creation, row-locked canonical-URL dedup, unique-violation retry,
//! subscriber fan-out, and per-subscriber tag creation.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::Article;
use crate::parser::EntryRecord;
use crate::sanitizer;
use crate::url_normalize;

pub struct ProcessOutcome {
    pub new_article_ids: Vec<Uuid>,
    pub all_fetched_article_ids: Vec<Uuid>,
}

/// Processes one feed's freshly-parsed entries: dedup into the global
/// `articles` table, link to the feed, and fan out per-user state to
/// every active subscriber. Runs inside its own transaction; any
/// non-recoverable per-entry error rolls the whole batch back (§4.A
/// failure semantics) — the caller bumps the feed's error counters.
pub async fn process_entries(
    pool: &PgPool,
    feed_id: Uuid,
    entries: &[EntryRecord],
) -> Result<ProcessOutcome> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    ensure_partitions_for(&mut tx, entries).await?;

    let mut all_fetched = Vec::new();
    let mut assign_existing_to_subscribers = Vec::new();
    let mut new_articles_for_tagging: Vec<(Uuid, Vec<String>)> = Vec::new();

    for entry in entries {
        let canonical_url = url_normalize::normalize(&entry.url);

        let existing = find_article_for_update(&mut tx, &canonical_url).await?;

        let article_id = if let Some(article) = existing {
            all_fetched.push(article.id);
            let linked = article_source_exists(&mut tx, article.id, feed_id).await?;
            if !linked {
                assign_existing_to_subscribers.push(article.id);
            }
            article.id
        } else {
            if let Some(published_at) = entry.published_at {
                if published_at > Utc::now() {
                    // Dropped at ingestion; none of its side effects occur (§8 boundary behavior).
                    continue;
                }
            }
            let article = insert_article_with_retry(&mut tx, entry, &canonical_url).await?;
            all_fetched.push(article.id);
            new_articles_for_tagging.push((article.id, split_source_tags(&entry.categories)));
            article.id
        };

        create_article_source_link(&mut tx, article_id, feed_id).await?;
    }

    let new_article_ids: Vec<Uuid> = new_articles_for_tagging.iter().map(|(id, _)| *id).collect();

    fan_out_user_articles(&mut tx, feed_id, &new_article_ids).await?;
    fan_out_user_articles(&mut tx, feed_id, &assign_existing_to_subscribers).await?;

    for (article_id, tags) in &new_articles_for_tagging {
        tag_article_for_subscribers(&mut tx, feed_id, *article_id, tags).await?;
    }

    tx.commit().await.context("failed to commit article batch")?;

    Ok(ProcessOutcome {
        new_article_ids,
        all_fetched_article_ids: all_fetched,
    })
}

/// Category strings containing commas are split into individual tag
/// names and trimmed; duplicates within the entry suppressed.
fn split_source_tags(categories: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for cat in categories {
        for part in cat.split(',') {
            let t = part.trim();
            if !t.is_empty() && !out.contains(&t.to_string()) {
                out.push(t.to_string());
            }
        }
    }
    out
}

async fn ensure_partitions_for(tx: &mut Transaction<'_, Postgres>, entries: &[EntryRecord]) -> Result<()> {
    let mut months: Vec<DateTime<Utc>> = entries.iter().filter_map(|e| e.published_at).collect();
    let now = Utc::now();
    months.push(now);
    months.push(now + chrono::Duration::days(31));
    for month in months {
        ensure_partition_for_month(tx, month).await?;
    }
    Ok(())
}

pub async fn ensure_partition_for_month(
    tx: &mut Transaction<'_, Postgres>,
    month: DateTime<Utc>,
) -> Result<()> {
    let start = month.date_naive().with_day(1).unwrap();
    let end = if start.month() == 12 {
        start.with_year(start.year() + 1).unwrap().with_month(1).unwrap()
    } else {
        start.with_month(start.month() + 1).unwrap()
    };
    let partition_name = format!("articles_{:04}_{:02}", start.year(), start.month());
    let sql = format!(
        r#"CREATE TABLE IF NOT EXISTS content.{partition_name}
           PARTITION OF content.articles
           FOR VALUES FROM ('{start}') TO ('{end}')"#,
    );
    sqlx::query(&sql)
        .execute(&mut **tx)
        .await
        .context("failed to create monthly partition")?;
    Ok(())
}

async fn find_article_for_update(
    tx: &mut Transaction<'_, Postgres>,
    canonical_url: &str,
) -> Result<Option<Article>> {
    let article = sqlx::query_as::<_, Article>(
        r#"
        SELECT id, canonical_url, title, author, summary, content, source_tags,
               media_url, platform_metadata, published_at, created_at
        FROM content.articles
        WHERE canonical_url = $1
        FOR UPDATE
        "#,
    )
    .bind(canonical_url)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to look up article under row lock")?;
    Ok(article)
}

/// `content.articles` is range-partitioned by `published_at`, so Postgres
/// cannot enforce a single UNIQUE(canonical_url) constraint across
/// partitions. `content.article_urls` is a small, unpartitioned satellite
/// table holding the one true canonical-URL uniqueness constraint; it is
/// written in the same transaction as the articles row and is the only
/// thing the retry-on-conflict path actually relies on.
async fn claim_canonical_url(tx: &mut Transaction<'_, Postgres>, canonical_url: &str, article_id: Uuid) -> Result<bool> {
    let result = sqlx::query("INSERT INTO content.article_urls (canonical_url, article_id) VALUES ($1, $2)")
        .bind(canonical_url)
        .bind(article_id)
        .execute(&mut **tx)
        .await;
    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => Ok(false),
        Err(e) => Err(e).context("failed to claim canonical url"),
    }
}

async fn insert_article_with_retry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &EntryRecord,
    canonical_url: &str,
) -> Result<Article> {
    let title = crate::parser::decode_html_entities(&entry.title);
    let summary = entry.summary.as_deref().map(|s| truncate(s, 2000));
    let (sanitized_content, _plain_text) = entry
        .content
        .as_deref()
        .map(sanitizer::sanitize)
        .map(|(html, _)| (Some(html), ()))
        .unwrap_or((None, ()));

    let article_id = Uuid::new_v4();
    if !claim_canonical_url(tx, canonical_url, article_id).await? {
        // Concurrent creator won the race; re-read and treat as "found".
        return find_article_for_update(tx, canonical_url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("article vanished after unique violation"));
    }

    let insert_result = sqlx::query_as::<_, Article>(
        r#"
        INSERT INTO content.articles
            (id, canonical_url, title, author, summary, content, source_tags,
             media_url, platform_metadata, published_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
        RETURNING id, canonical_url, title, author, summary, content, source_tags,
                  media_url, platform_metadata, published_at, created_at
        "#,
    )
    .bind(article_id)
    .bind(canonical_url)
    .bind(&title)
    .bind(&entry.author)
    .bind(&summary)
    .bind(&sanitized_content)
    .bind(json!(entry.categories))
    .bind(&entry.media_url)
    .bind(&entry.platform_metadata)
    .bind(entry.published_at.unwrap_or_else(Utc::now))
    .fetch_one(&mut **tx)
    .await;

    match insert_result {
        Ok(article) => Ok(article),
        Err(sqlx::Error::Database(db_err)) if is_partition_missing(&db_err) => {
            let published = entry.published_at.unwrap_or_else(Utc::now);
            ensure_partition_for_month(tx, published).await?;
            insert_article_retry_once(tx, entry, canonical_url, article_id, &title, &summary, &sanitized_content, published).await
        }
        Err(e) => Err(e).context("failed to insert article"),
    }
}

fn is_partition_missing(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    // Postgres raises 23514 (check_violation) / 42P01-style errors through
    // the partition routing machinery when no partition matches a key; we
    // treat any "no partition of relation" message as this case.
    db_err.message().contains("no partition of relation")
}

async fn insert_article_retry_once(
    tx: &mut Transaction<'_, Postgres>,
    entry: &EntryRecord,
    canonical_url: &str,
    article_id: Uuid,
    title: &str,
    summary: &Option<String>,
    sanitized_content: &Option<String>,
    published: DateTime<Utc>,
) -> Result<Article> {
    let article = sqlx::query_as::<_, Article>(
        r#"
        INSERT INTO content.articles
            (id, canonical_url, title, author, summary, content, source_tags,
             media_url, platform_metadata, published_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
        RETURNING id, canonical_url, title, author, summary, content, source_tags,
                  media_url, platform_metadata, published_at, created_at
        "#,
    )
    .bind(article_id)
    .bind(canonical_url)
    .bind(title)
    .bind(&entry.author)
    .bind(summary)
    .bind(sanitized_content)
    .bind(json!(entry.categories))
    .bind(&entry.media_url)
    .bind(&entry.platform_metadata)
    .bind(published)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert article after partition creation")?;
    Ok(article)
}

async fn article_source_exists(
    tx: &mut Transaction<'_, Postgres>,
    article_id: Uuid,
    feed_id: Uuid,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM content.article_sources WHERE article_id = $1 AND feed_id = $2)",
    )
    .bind(article_id)
    .bind(feed_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to check article source link")?;
    Ok(exists)
}

async fn create_article_source_link(
    tx: &mut Transaction<'_, Postgres>,
    article_id: Uuid,
    feed_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO content.article_sources (article_id, feed_id, created_at)
        VALUES ($1, $2, now())
        ON CONFLICT (article_id, feed_id) DO NOTHING
        "#,
    )
    .bind(article_id)
    .bind(feed_id)
    .execute(&mut **tx)
    .await
    .context("failed to create article source link")?;
    Ok(())
}

/// Bulk `INSERT ... ON CONFLICT DO NOTHING` fan-out of UserArticle rows to
/// every active subscriber of the feed. Must stay one statement (§4.S).
async fn fan_out_user_articles(
    tx: &mut Transaction<'_, Postgres>,
    feed_id: Uuid,
    article_ids: &[Uuid],
) -> Result<()> {
    if article_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO personalization.user_articles (user_id, article_id, is_read, read_later, read_at)
        SELECT s.user_id, a.article_id, false, false, NULL
        FROM personalization.subscriptions s
        CROSS JOIN unnest($2::uuid[]) AS a(article_id)
        WHERE s.feed_id = $1 AND s.is_active = true
        ON CONFLICT (user_id, article_id) DO NOTHING
        "#,
    )
    .bind(feed_id)
    .bind(article_ids)
    .execute(&mut **tx)
    .await
    .context("failed to fan out user articles")?;
    Ok(())
}

async fn tag_article_for_subscribers(
    tx: &mut Transaction<'_, Postgres>,
    feed_id: Uuid,
    article_id: Uuid,
    tags: &[String],
) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }
    let subscriber_ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT user_id FROM personalization.subscriptions WHERE feed_id = $1 AND is_active = true",
    )
    .bind(feed_id)
    .fetch_all(&mut **tx)
    .await
    .context("failed to list subscribers for tagging")?;

    for user_id in subscriber_ids {
        for tag_name in tags {
            let tag_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO personalization.user_tags (id, user_id, name, article_count, created_at)
                VALUES ($1, $2, $3, 0, now())
                ON CONFLICT (user_id, name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(tag_name)
            .fetch_one(&mut **tx)
            .await
            .context("failed to get-or-create tag")?;

            sqlx::query(
                r#"
                INSERT INTO personalization.article_tags (user_id, article_id, user_tag_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(article_id)
            .bind(tag_id)
            .execute(&mut **tx)
            .await
            .context("failed to link article tag")?;
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_comma_separated_source_tags() {
        let tags = split_source_tags(&["tech, rust".to_string(), "tech".to_string()]);
        assert_eq!(tags, vec!["tech", "rust"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
