//! Auth (H): password hashing, session mint/verify/cap, CSRF, IP
//! derivation, cookie construction. Grounded on `application/auth/auth.py`
//! (register/login/logout/change_password flow),
//! `infrastructure/auth/session.py` (`CookieManager` cookie shape), and
//! `infrastructure/auth/ip_utils.py` (trusted-proxy CIDR + header chain).

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::rngs::OsRng;
use rand::RngCore;
use rocket::http::{Cookie, SameSite};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::net::IpAddr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Session, User};
use crate::sessions;

pub const SESSION_COOKIE_NAME: &str = "session_id";
pub const CSRF_COOKIE_NAME: &str = "csrf_token";

/// PBKDF2-SHA256 family, hash string self-identifying (`$pbkdf2-sha256$...`)
/// per §4.H.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Pbkdf2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

/// `{session_id}.{32-byte url-safe secret}`. The stored value server-side
/// is `SHA-256(cookie_value)`.
pub fn mint_session_token() -> (Uuid, String, String) {
    let session_id = Uuid::new_v4();
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let secret_b64 = URL_SAFE_NO_PAD.encode(secret);
    let cookie_value = format!("{session_id}.{secret_b64}");
    let hash = hash_cookie_value(&cookie_value);
    (session_id, cookie_value, hash)
}

pub fn hash_cookie_value(cookie_value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cookie_value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Timing-safe comparison of two hex-encoded SHA-256 hashes (§8 property 8).
fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub fn mint_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parses `session_id` out of a cookie value of the form
/// `{session_id}.{secret}`. Returns `None` on any malformed input; callers
/// translate this into "no current session" without leaking which step
/// failed (§7 propagation policy).
pub fn parse_session_id(cookie_value: &str) -> Option<Uuid> {
    let (id_part, _) = cookie_value.split_once('.')?;
    Uuid::parse_str(id_part).ok()
}

/// Verifies a session cookie value against the stored hash for its
/// claimed session id, touching `last_used` on success.
pub async fn verify_session(pool: &PgPool, cookie_value: &str) -> Result<Option<Session>> {
    let Some(session_id) = parse_session_id(cookie_value) else {
        return Ok(None);
    };
    let Some(session) = sessions::get_session_by_id(pool, session_id).await? else {
        return Ok(None);
    };
    let computed = hash_cookie_value(cookie_value);
    if !hashes_match(&computed, &session.cookie_hash) {
        return Ok(None);
    }
    sessions::touch_last_used(pool, session.id).await?;
    Ok(Some(session))
}

/// Before creating a new session, evicts the oldest if the user is already
/// at the cap. Trigger is inclusive (see DESIGN.md Open Question decision):
/// count >= MAX_ACTIVE_SESSIONS evicts before the new row lands.
pub async fn enforce_session_cap(pool: &PgPool, user_id: Uuid, max_active: i64) -> Result<()> {
    let count = sessions::get_active_session_count(pool, user_id).await?;
    if count >= max_active {
        sessions::revoke_oldest_session(pool, user_id).await?;
    }
    Ok(())
}

pub fn session_cookie<'c>(cookie_value: String, max_age_days: i64) -> Cookie<'c> {
    Cookie::build(SESSION_COOKIE_NAME, cookie_value)
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(rocket::time::Duration::days(max_age_days))
        .finish()
}

pub fn csrf_cookie<'c>(token: String, max_age_days: i64) -> Cookie<'c> {
    Cookie::build(CSRF_COOKIE_NAME, token)
        .http_only(false)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(rocket::time::Duration::days(max_age_days))
        .finish()
}

// --- IP derivation (ip_utils.py) ---------------------------------------

/// A parsed IPv4/IPv6 CIDR block for trusted-proxy matching. Hand-rolled
/// rather than pulling in a CIDR crate: the match is a handful of bitwise
/// comparisons and the corpus has no existing CIDR dependency to align
/// with.
#[derive(Debug, Clone, Copy)]
pub struct CidrBlock {
    addr: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr_s, prefix_s) = s.split_once('/')?;
        let addr: IpAddr = addr_s.trim().parse().ok()?;
        let prefix: u8 = prefix_s.trim().parse().ok()?;
        Some(CidrBlock { addr, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let net_bits = u32::from(net);
                let ip_bits = u32::from(*ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix.min(32))
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net_bits = u128::from(net);
                let ip_bits = u128::from(*ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix.min(128))
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            _ => false,
        }
    }
}

/// Direct connection IP is the default. If the immediate peer is in
/// `trusted_proxies`, consult `X-Forwarded-For` (first public IP) then
/// `X-Real-IP`; otherwise proxy headers are ignored entirely.
pub fn derive_ip(
    peer_ip: IpAddr,
    trusted_proxies: &[CidrBlock],
    x_forwarded_for: Option<&str>,
    x_real_ip: Option<&str>,
) -> IpAddr {
    let is_trusted = trusted_proxies.iter().any(|b| b.contains(&peer_ip));
    if !is_trusted {
        return peer_ip;
    }
    if let Some(xff) = x_forwarded_for {
        if let Some(first_public) = xff
            .split(',')
            .map(|s| s.trim())
            .filter_map(|s| s.parse::<IpAddr>().ok())
            .find(|ip| is_public(ip))
        {
            return first_public;
        }
    }
    if let Some(real_ip) = x_real_ip.and_then(|s| s.trim().parse::<IpAddr>().ok()) {
        return real_ip;
    }
    peer_ip
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local()),
        IpAddr::V6(v6) => !(v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00),
    }
}

// --- Application-level flows (auth.py's AuthApplication) ---------------

pub struct LoginOutcome {
    pub cookie_value: String,
    pub csrf_token: String,
    pub session: Session,
}

pub async fn register(
    pool: &PgPool,
    username: &str,
    password: &str,
    min_username_len: usize,
    max_username_len: usize,
    min_password_len: usize,
    max_password_len: usize,
    first_user_is_admin: bool,
) -> Result<User, AppError> {
    if username.len() < min_username_len || username.len() > max_username_len {
        return Err(AppError::Validation("invalid username length".into()));
    }
    if password.len() < min_password_len || password.len() > max_password_len {
        return Err(AppError::InvalidPassword("password does not meet length requirements".into()));
    }

    let existing: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM personalization.users WHERE lower(username) = lower($1)",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;
    if existing.is_some() {
        return Err(AppError::Conflict("username already taken".into()));
    }

    let user_count: i64 = sqlx::query_scalar("SELECT count(*) FROM personalization.users")
        .fetch_one(pool)
        .await
        .map_err(AppError::from)?;
    let is_first_user = user_count == 0;
    let is_admin = is_first_user && first_user_is_admin;

    let password_hash = hash_password(password).map_err(AppError::from)?;
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO personalization.users (id, username, password_hash, is_admin, created_at, updated_at)
        VALUES ($1, $2, $3, $4, now(), now())
        RETURNING id, username, password_hash, is_admin, created_at, updated_at, last_login
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(password_hash)
    .bind(is_admin)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    Ok(user)
}

pub async fn login(
    pool: &PgPool,
    username: &str,
    password: &str,
    ip: IpAddr,
    user_agent: Option<&str>,
    max_active_sessions: i64,
    session_timeout_days: i64,
) -> Result<LoginOutcome, AppError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, is_admin, created_at, updated_at, last_login FROM personalization.users WHERE lower(username) = lower($1)",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?
    .ok_or(AppError::InvalidCredentials)?;

    if !verify_password(password, &user.password_hash) {
        return Err(AppError::InvalidCredentials);
    }

    sqlx::query("UPDATE personalization.users SET last_login = now() WHERE id = $1")
        .bind(user.id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;

    enforce_session_cap(pool, user.id, max_active_sessions)
        .await
        .map_err(AppError::from)?;

    let (_, cookie_value, hash) = mint_session_token();
    let expires_at = Utc::now() + Duration::days(session_timeout_days);
    let session = sessions::create_session(
        pool,
        user.id,
        &hash,
        expires_at,
        user_agent,
        Some(&ip.to_string()),
    )
    .await
    .map_err(AppError::from)?;

    Ok(LoginOutcome {
        cookie_value,
        csrf_token: mint_csrf_token(),
        session,
    })
}

pub async fn logout(pool: &PgPool, cookie_value: &str) -> Result<()> {
    if let Some(session_id) = parse_session_id(cookie_value) {
        if let Some(session) = sessions::get_session_by_id(pool, session_id).await? {
            sessions::revoke_session_by_id(pool, session.user_id, session.id).await?;
        }
    }
    Ok(())
}

/// Revokes ALL sessions belonging to the user after a password change.
pub async fn change_password(
    pool: &PgPool,
    user_id: Uuid,
    current_password: &str,
    new_password: &str,
    min_password_len: usize,
    max_password_len: usize,
) -> Result<(), AppError> {
    let stored_hash: String = sqlx::query_scalar(
        "SELECT password_hash FROM personalization.users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;

    if !verify_password(current_password, &stored_hash) {
        return Err(AppError::InvalidCredentials);
    }
    if new_password.len() < min_password_len || new_password.len() > max_password_len {
        return Err(AppError::InvalidPassword("password does not meet length requirements".into()));
    }

    let new_hash = hash_password(new_password).context("hashing new password").map_err(AppError::from)?;
    sqlx::query("UPDATE personalization.users SET password_hash = $1, updated_at = now() WHERE id = $2")
        .bind(new_hash)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;

    sessions::revoke_all_user_sessions(pool, user_id)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn session_token_parses_back() {
        let (id, cookie_value, hash) = mint_session_token();
        assert_eq!(parse_session_id(&cookie_value), Some(id));
        assert_eq!(hash_cookie_value(&cookie_value), hash);
    }

    #[test]
    fn cidr_contains_v4() {
        let block = CidrBlock::parse("10.0.0.0/8").unwrap();
        assert!(block.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!block.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn derive_ip_ignores_headers_from_untrusted_peer() {
        let peer: IpAddr = "8.8.8.8".parse().unwrap();
        let trusted = vec![CidrBlock::parse("10.0.0.0/8").unwrap()];
        let derived = derive_ip(peer, &trusted, Some("1.2.3.4"), None);
        assert_eq!(derived, peer);
    }

    #[test]
    fn derive_ip_uses_xff_from_trusted_peer() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let trusted = vec![CidrBlock::parse("10.0.0.0/8").unwrap()];
        let derived = derive_ip(peer, &trusted, Some("203.0.113.5, 10.0.0.1"), None);
        assert_eq!(derived, "203.0.113.5".parse::<IpAddr>().unwrap());
    }
}
