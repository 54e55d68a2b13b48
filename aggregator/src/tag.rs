//! Tag engine (T). Grounded on `application/tag/tag.py`: sanitize-then-
//! get-or-create, rename-under-uniqueness, and the add/remove diff used
//! by `sync_article_tags`.

use anyhow::Context;
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::UserTag;

/// Strips control characters, collapses internal whitespace, trims, and
/// rejects empty/too-long names.
pub fn sanitize_tag_name(raw: &str, max_len: usize) -> Result<String, AppError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim().to_string();
    if trimmed.is_empty() || trimmed.chars().count() > max_len {
        return Err(AppError::Validation("invalid tag name".into()));
    }
    Ok(trimmed)
}

pub async fn get_user_tag(pool: &PgPool, user_id: Uuid, tag_id: Uuid) -> Result<UserTag, AppError> {
    sqlx::query_as::<_, UserTag>(
        "SELECT id, user_id, name, article_count, created_at FROM personalization.user_tags WHERE id = $1 AND user_id = $2",
    )
    .bind(tag_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::NotFound("tag not found".into()))
}

pub async fn get_user_tags(pool: &PgPool, user_id: Uuid, limit: i64, offset: i64) -> Result<Vec<UserTag>, AppError> {
    let tags = sqlx::query_as::<_, UserTag>(
        r#"
        SELECT id, user_id, name, article_count, created_at
        FROM personalization.user_tags
        WHERE user_id = $1
        ORDER BY name ASC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;
    Ok(tags)
}

/// Get-or-create under unique `(user, name)`; on an integrity race, the
/// `ON CONFLICT ... RETURNING` form below re-reads rather than raising.
pub async fn create_user_tag(pool: &PgPool, user_id: Uuid, name: &str, max_name_length: usize) -> Result<UserTag, AppError> {
    let name = sanitize_tag_name(name, max_name_length)?;
    let tag = sqlx::query_as::<_, UserTag>(
        r#"
        INSERT INTO personalization.user_tags (id, user_id, name, article_count, created_at)
        VALUES ($1, $2, $3, 0, now())
        ON CONFLICT (user_id, name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id, user_id, name, article_count, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(&name)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    Ok(tag)
}

pub async fn update_user_tag(pool: &PgPool, user_id: Uuid, tag_id: Uuid, new_name: &str, max_name_length: usize) -> Result<UserTag, AppError> {
    let name = sanitize_tag_name(new_name, max_name_length)?;
    let result = sqlx::query_as::<_, UserTag>(
        r#"
        UPDATE personalization.user_tags
        SET name = $1
        WHERE id = $2 AND user_id = $3
        RETURNING id, user_id, name, article_count, created_at
        "#,
    )
    .bind(&name)
    .bind(tag_id)
    .bind(user_id)
    .fetch_one(pool)
    .await;

    match result {
        Ok(tag) => Ok(tag),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            Err(AppError::Conflict("tag name already exists".into()))
        }
        Err(e) => Err(AppError::from(e)),
    }
}

pub async fn delete_user_tag(pool: &PgPool, user_id: Uuid, tag_id: Uuid) -> Result<(), AppError> {
    sqlx::query("DELETE FROM personalization.user_tags WHERE id = $1 AND user_id = $2")
        .bind(tag_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Computes `added = desired - current`, `removed = current - desired`,
/// applies both. All tag ids must be owned by `user_id`.
pub async fn sync_article_tags(
    pool: &PgPool,
    user_id: Uuid,
    article_id: Uuid,
    desired_tag_ids: &[Uuid],
) -> Result<(), AppError> {
    let owned_count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM personalization.user_tags WHERE user_id = $1 AND id = ANY($2)",
    )
    .bind(user_id)
    .bind(desired_tag_ids)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    if owned_count as usize != desired_tag_ids.len() {
        return Err(AppError::Validation("one or more tags are not owned by the requesting user".into()));
    }

    let current_tag_ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT user_tag_id FROM personalization.article_tags WHERE user_id = $1 AND article_id = $2",
    )
    .bind(user_id)
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;

    let current: HashSet<Uuid> = current_tag_ids.into_iter().collect();
    let desired: HashSet<Uuid> = desired_tag_ids.iter().copied().collect();

    let added: Vec<Uuid> = desired.difference(&current).copied().collect();
    let removed: Vec<Uuid> = current.difference(&desired).copied().collect();

    let mut tx = pool.begin().await.map_err(AppError::from)?;
    if !removed.is_empty() {
        sqlx::query(
            "DELETE FROM personalization.article_tags WHERE user_id = $1 AND article_id = $2 AND user_tag_id = ANY($3)",
        )
        .bind(user_id)
        .bind(article_id)
        .bind(&removed)
        .execute(&mut *tx)
        .await
        .context("failed to remove article tags")
        .map_err(AppError::from)?;
    }
    for tag_id in &added {
        sqlx::query(
            "INSERT INTO personalization.article_tags (user_id, article_id, user_tag_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(article_id)
        .bind(tag_id)
        .execute(&mut *tx)
        .await
        .context("failed to add article tags")
        .map_err(AppError::from)?;
    }

    let touched: Vec<Uuid> = added.iter().chain(removed.iter()).copied().collect();
    if !touched.is_empty() {
        sqlx::query(
            r#"
            UPDATE personalization.user_tags t
            SET article_count = (SELECT count(*) FROM personalization.article_tags at WHERE at.user_tag_id = t.id)
            WHERE t.id = ANY($1)
            "#,
        )
        .bind(&touched)
        .execute(&mut *tx)
        .await
        .context("failed to refresh tag article counts")
        .map_err(AppError::from)?;
    }

    tx.commit().await.map_err(AppError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_whitespace_and_trims() {
        let name = sanitize_tag_name("  hello   world  ", 64).unwrap();
        assert_eq!(name, "hello world");
    }

    #[test]
    fn sanitize_rejects_empty() {
        assert!(sanitize_tag_name("   ", 64).is_err());
    }

    #[test]
    fn sanitize_rejects_too_long() {
        assert!(sanitize_tag_name(&"a".repeat(65), 64).is_err());
    }
}
