//! Subscription lifecycle (U): unsubscribe and bulk OPML rollback, both
//! built on the same reachability-aware cleanup. Grounded on §4.U and
//! `workers/functions.py`'s rollback routine, which the teacher's source
//! shares between the two call sites.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// Deletes UserArticle/ArticleTag rows for articles that become
/// unreachable once the given subscriptions are removed, then deletes the
/// subscriptions themselves. The global Article rows are never touched.
/// Returns the number of subscriptions removed.
async fn reachability_aware_unsubscribe(pool: &PgPool, user_id: Uuid, subscription_ids: &[Uuid]) -> Result<u64> {
    if subscription_ids.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await.context("failed to start unsubscribe transaction")?;

    let feed_ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT feed_id FROM personalization.subscriptions WHERE id = ANY($1) AND user_id = $2",
    )
    .bind(subscription_ids)
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to resolve feed ids for subscriptions")?;

    // Articles linked to the feeds being dropped...
    let candidate_article_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT src.article_id
        FROM content.article_sources src
        WHERE src.feed_id = ANY($1)
        "#,
    )
    .bind(&feed_ids)
    .fetch_all(&mut *tx)
    .await
    .context("failed to list candidate articles")?;

    // ...minus articles still reachable via the user's remaining feeds.
    let unreachable_article_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT a.id FROM unnest($1::uuid[]) AS a(id)
        WHERE NOT EXISTS (
            SELECT 1
            FROM content.article_sources src
            JOIN personalization.subscriptions s
                ON s.feed_id = src.feed_id AND s.user_id = $2 AND s.is_active = true
            WHERE src.article_id = a.id AND s.feed_id != ALL($3)
        )
        "#,
    )
    .bind(&candidate_article_ids)
    .bind(user_id)
    .bind(&feed_ids)
    .fetch_all(&mut *tx)
    .await
    .context("failed to compute unreachable articles")?;

    if !unreachable_article_ids.is_empty() {
        sqlx::query(
            "DELETE FROM personalization.article_tags WHERE user_id = $1 AND article_id = ANY($2)",
        )
        .bind(user_id)
        .bind(&unreachable_article_ids)
        .execute(&mut *tx)
        .await
        .context("failed to remove tag links")?;

        sqlx::query(
            "DELETE FROM personalization.user_articles WHERE user_id = $1 AND article_id = ANY($2)",
        )
        .bind(user_id)
        .bind(&unreachable_article_ids)
        .execute(&mut *tx)
        .await
        .context("failed to remove user articles")?;
    }

    let result = sqlx::query(
        "DELETE FROM personalization.subscriptions WHERE id = ANY($1) AND user_id = $2",
    )
    .bind(subscription_ids)
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .context("failed to delete subscriptions")?;

    tx.commit().await.context("failed to commit unsubscribe")?;
    Ok(result.rows_affected())
}

pub async fn unsubscribe(pool: &PgPool, user_id: Uuid, subscription_id: Uuid) -> Result<bool> {
    let removed = reachability_aware_unsubscribe(pool, user_id, &[subscription_id]).await?;
    Ok(removed > 0)
}

/// Bulk OPML rollback: enumerate Subscriptions created with `import_id`,
/// apply the same cleanup, delete them in one statement. Idempotent: a
/// second call against the same import_id removes zero rows (§8 scenario 6).
pub async fn rollback_import(pool: &PgPool, user_id: Uuid, import_id: Uuid) -> Result<u64> {
    let subscription_ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM personalization.subscriptions WHERE user_id = $1 AND import_id = $2",
    )
    .bind(user_id)
    .bind(import_id)
    .fetch_all(pool)
    .await
    .context("failed to list subscriptions for import batch")?;

    reachability_aware_unsubscribe(pool, user_id, &subscription_ids).await
}
