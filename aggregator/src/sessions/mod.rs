//! Session repository (the `Session` row from §3, not an HTTP concept).
//! Grounded on `infrastructure/repositories/session.py`'s contract, as
//! inferred from its callers in `auth.py`: create, count-active,
//! revoke-oldest, revoke-by-id, revoke-all, list-for-user.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Session;

pub async fn create_session(
    pool: &PgPool,
    user_id: Uuid,
    cookie_hash: &str,
    expires_at: DateTime<Utc>,
    user_agent: Option<&str>,
    ip_address: Option<&str>,
) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(
        r#"
        INSERT INTO personalization.sessions
            (id, user_id, cookie_hash, expires_at, last_used, user_agent, ip_address, created_at)
        VALUES ($1, $2, $3, $4, now(), $5, $6, now())
        RETURNING id, user_id, cookie_hash, expires_at, last_used, user_agent, ip_address, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(cookie_hash)
    .bind(expires_at)
    .bind(user_agent)
    .bind(ip_address)
    .fetch_one(pool)
    .await
    .context("failed to insert session")?;
    Ok(session)
}

pub async fn get_active_session_count(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM personalization.sessions WHERE user_id = $1 AND expires_at > now()",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to count active sessions")?;
    Ok(count)
}

/// Deletes the session with the smallest `last_used` for the user.
/// A no-op (not an error) if the user has no sessions.
pub async fn revoke_oldest_session(pool: &PgPool, user_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM personalization.sessions
        WHERE id = (
            SELECT id FROM personalization.sessions
            WHERE user_id = $1
            ORDER BY last_used ASC
            LIMIT 1
        )
        "#,
    )
    .bind(user_id)
    .execute(pool)
    .await
    .context("failed to revoke oldest session")?;
    Ok(())
}

pub async fn revoke_session_by_id(pool: &PgPool, user_id: Uuid, session_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM personalization.sessions WHERE id = $1 AND user_id = $2",
    )
    .bind(session_id)
    .bind(user_id)
    .execute(pool)
    .await
    .context("failed to revoke session")?;
    Ok(result.rows_affected() > 0)
}

pub async fn revoke_all_user_sessions(pool: &PgPool, user_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM personalization.sessions WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to revoke all sessions")?;
    Ok(result.rows_affected())
}

pub async fn get_user_sessions(pool: &PgPool, user_id: Uuid) -> Result<Vec<Session>> {
    let sessions = sqlx::query_as::<_, Session>(
        r#"
        SELECT id, user_id, cookie_hash, expires_at, last_used, user_agent, ip_address, created_at
        FROM personalization.sessions
        WHERE user_id = $1 AND expires_at > now()
        ORDER BY last_used DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list sessions")?;
    Ok(sessions)
}

pub async fn get_session_by_id(pool: &PgPool, session_id: Uuid) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        r#"
        SELECT id, user_id, cookie_hash, expires_at, last_used, user_agent, ip_address, created_at
        FROM personalization.sessions
        WHERE id = $1 AND expires_at > now()
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch session")?;
    Ok(session)
}

pub async fn touch_last_used(pool: &PgPool, session_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE personalization.sessions SET last_used = now() WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await
        .context("failed to touch session")?;
    Ok(())
}
