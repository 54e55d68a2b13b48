//! HTTP surface (X), §6.1. Grounded on `mynewslens/src/server.rs`'s
//! `AppState`/launch pattern, generalized from JWT bearer auth to the
//! cookie-session model in `auth`. Thin routing layer: handlers validate
//! the request shape, delegate to the domain modules, and translate
//! `AppError` via its `Responder` impl.

use anyhow::Result;
use base64::Engine as _;
use common::Config;
use rocket::data::{Data, ToByteUnit};
use rocket::form::FromForm;
use rocket::http::{CookieJar, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put, routes};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::User;
use crate::{auth, feed, folder, job, opml, preferences, search, subscription, tag};

pub struct AppState {
    pub db: PgPool,
    pub redis: redis::Client,
    pub config: Config,
    pub trusted_proxies: Vec<auth::CidrBlock>,
}

/// Authenticated caller, resolved from the `session_id` cookie.
pub struct CurrentUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CurrentUser {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let state = match req.rocket().state::<AppState>() {
            Some(s) => s,
            None => return Outcome::Error((Status::InternalServerError, AppError::Fatal("app state missing".into()))),
        };
        let cookie_value = match req.cookies().get_private(auth::SESSION_COOKIE_NAME) {
            Some(c) => c.value().to_string(),
            None => return Outcome::Error((Status::Unauthorized, AppError::InvalidCredentials)),
        };
        let session = match auth::verify_session(&state.db, &cookie_value).await {
            Ok(Some(s)) => s,
            _ => return Outcome::Error((Status::Unauthorized, AppError::InvalidCredentials)),
        };
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, is_admin, created_at, updated_at, last_login FROM personalization.users WHERE id = $1",
        )
        .bind(session.user_id)
        .fetch_optional(&state.db)
        .await;
        match user {
            Ok(Some(user)) => Outcome::Success(CurrentUser(user)),
            _ => Outcome::Error((Status::Unauthorized, AppError::InvalidCredentials)),
        }
    }
}

/// Request guard enforcing the double-submit CSRF check on every
/// state-changing route: the `X-CSRF-Token` header must equal the
/// `csrf_token` cookie. Applied uniformly rather than inline per-handler
/// so no mutating route can accidentally skip it.
pub struct CsrfProtected;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CsrfProtected {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let cookie_token = req.cookies().get(auth::CSRF_COOKIE_NAME).map(|c| c.value().to_string());
        let header_token = req.headers().get_one("X-CSRF-Token").map(String::from);
        match (cookie_token, header_token) {
            (Some(c), Some(h)) if c == h => Outcome::Success(CsrfProtected),
            _ => Outcome::Error((Status::BadRequest, AppError::Validation("missing or invalid CSRF token".into()))),
        }
    }
}

fn client_ip(req_ip: IpAddr, state: &AppState, xff: Option<&str>, xri: Option<&str>) -> IpAddr {
    auth::derive_ip(req_ip, &state.trusted_proxies, xff, xri)
}

fn parse_uuid_csv(raw: &str) -> Vec<Uuid> {
    raw.split(',').filter_map(|s| Uuid::parse_str(s.trim()).ok()).collect()
}

// --- Auth routes --------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

#[post("/auth/register", data = "<body>")]
async fn register(state: &rocket::State<AppState>, body: Json<RegisterRequest>) -> Result<status::Created<Json<Value>>, AppError> {
    let users_cfg = state.config.users.clone().unwrap_or(common::UsersConfig {
        min_username_length: None,
        max_username_length: None,
        min_password_length: None,
        max_password_length: None,
        first_user_is_admin: None,
    });
    let user = auth::register(
        &state.db,
        &body.username,
        &body.password,
        users_cfg.min_username_length(),
        users_cfg.max_username_length(),
        users_cfg.min_password_length(),
        users_cfg.max_password_length(),
        users_cfg.first_user_is_admin(),
    )
    .await?;
    Ok(status::Created::new("/auth/login").body(Json(serde_json::json!({ "id": user.id, "username": user.username }))))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[post("/auth/login", data = "<body>")]
async fn login(
    state: &rocket::State<AppState>,
    cookies: &CookieJar<'_>,
    body: Json<LoginRequest>,
    remote: SocketAddrGuard,
    headers: HeaderGuard,
) -> Result<Json<Value>, AppError> {
    let session_cfg = state.config.session.clone().unwrap_or(common::SessionConfig {
        timeout_days: None,
        cookie_name: None,
        csrf_cookie_name: None,
        csrf_token_length: None,
        max_active_sessions: None,
    });
    let ip = client_ip(remote.0, state, headers.xff.as_deref(), headers.xri.as_deref());
    let outcome = auth::login(
        &state.db,
        &body.username,
        &body.password,
        ip,
        headers.user_agent.as_deref(),
        session_cfg.max_active_sessions(),
        session_cfg.timeout_days(),
    )
    .await?;

    cookies.add_private(auth::session_cookie(outcome.cookie_value, session_cfg.timeout_days()));
    cookies.add(auth::csrf_cookie(outcome.csrf_token.clone(), session_cfg.timeout_days()));
    Ok(Json(serde_json::json!({ "session_id": outcome.session.id })))
}

#[post("/auth/logout")]
async fn logout(state: &rocket::State<AppState>, cookies: &CookieJar<'_>) -> Result<Json<Value>, AppError> {
    if let Some(cookie) = cookies.get_private(auth::SESSION_COOKIE_NAME) {
        auth::logout(&state.db, cookie.value()).await.map_err(AppError::from)?;
    }
    cookies.remove_private(rocket::http::Cookie::named(auth::SESSION_COOKIE_NAME));
    cookies.remove(rocket::http::Cookie::named(auth::CSRF_COOKIE_NAME));
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[post("/auth/change-password", data = "<body>")]
async fn change_password(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    body: Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    let users_cfg = state.config.users.clone().unwrap_or(common::UsersConfig {
        min_username_length: None,
        max_username_length: None,
        min_password_length: None,
        max_password_length: None,
        first_user_is_admin: None,
    });
    auth::change_password(
        &state.db,
        user.0.id,
        &body.current_password,
        &body.new_password,
        users_cfg.min_password_length(),
        users_cfg.max_password_length(),
    )
    .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[get("/auth/sessions")]
async fn list_sessions(state: &rocket::State<AppState>, user: CurrentUser) -> Result<Json<Value>, AppError> {
    let sessions = crate::sessions::get_user_sessions(&state.db, user.0.id).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!(sessions)))
}

#[delete("/auth/sessions/<id>")]
async fn revoke_session(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, id: Uuid) -> Result<Json<Value>, AppError> {
    crate::sessions::revoke_session_by_id(&state.db, user.0.id, id).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- Articles ------------------------------------------------------------

/// Opaque pagination bookmark (Glossary: "Cursor: opaque base64(JSON)
/// bookmark"). Encoding then decoding round-trips the original pair;
/// anything that isn't valid base64/JSON decodes to `None` rather than
/// erroring (§8).
#[derive(serde::Serialize, serde::Deserialize)]
struct ArticleCursor {
    published_at: chrono::DateTime<chrono::Utc>,
    id: Uuid,
}

fn encode_cursor(published_at: chrono::DateTime<chrono::Utc>, id: Uuid) -> String {
    let json = serde_json::to_vec(&ArticleCursor { published_at, id }).expect("cursor serializes");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(raw: &str) -> Option<(chrono::DateTime<chrono::Utc>, Uuid)> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw).ok()?;
    let cursor: ArticleCursor = serde_json::from_slice(&bytes).ok()?;
    Some((cursor.published_at, cursor.id))
}

#[derive(FromForm)]
struct ArticleFilters<'r> {
    cursor: Option<&'r str>,
    subscription_ids: Option<&'r str>,
    tag_ids: Option<&'r str>,
    folder_ids: Option<&'r str>,
    is_read: Option<bool>,
    read_later: Option<bool>,
    q: Option<&'r str>,
    from_date: Option<&'r str>,
    to_date: Option<&'r str>,
    limit: Option<i64>,
}

#[get("/articles?<filters..>")]
async fn list_articles(state: &rocket::State<AppState>, user: CurrentUser, filters: ArticleFilters<'_>) -> Result<Json<Value>, AppError> {
    let limit = filters.limit.unwrap_or(50).clamp(1, 200);
    let cursor: Option<(chrono::DateTime<chrono::Utc>, Uuid)> = filters.cursor.and_then(decode_cursor);
    let subscription_ids = filters.subscription_ids.map(parse_uuid_csv);
    let tag_ids = filters.tag_ids.map(parse_uuid_csv);
    let folder_ids = filters.folder_ids.map(parse_uuid_csv);
    let from_date: Option<chrono::DateTime<chrono::Utc>> = filters.from_date.and_then(|s| s.parse().ok());
    let to_date: Option<chrono::DateTime<chrono::Utc>> = filters.to_date.and_then(|s| s.parse().ok());
    let q_pattern = filters.q.map(|q| format!("%{q}%"));

    let rows = sqlx::query_as::<_, crate::models::Article>(
        r#"
        SELECT DISTINCT a.id, a.canonical_url, a.title, a.author, a.summary, a.content, a.source_tags,
               a.media_url, a.platform_metadata, a.published_at, a.created_at
        FROM content.articles a
        JOIN personalization.user_articles ua ON ua.article_id = a.id
        JOIN content.article_sources src ON src.article_id = a.id
        JOIN personalization.subscriptions s ON s.feed_id = src.feed_id AND s.user_id = ua.user_id
        LEFT JOIN personalization.article_tags at ON at.article_id = a.id AND at.user_id = ua.user_id
        WHERE ua.user_id = $1
          AND ($2::uuid[] IS NULL OR s.id = ANY($2))
          AND ($3::uuid[] IS NULL OR s.folder_id = ANY($3))
          AND ($4::uuid[] IS NULL OR at.user_tag_id = ANY($4))
          AND ($5::bool IS NULL OR ua.is_read = $5)
          AND ($6::bool IS NULL OR ua.read_later = $6)
          AND ($7::text IS NULL OR a.title ILIKE $7)
          AND ($8::timestamptz IS NULL OR a.published_at >= $8)
          AND ($9::timestamptz IS NULL OR a.published_at <= $9)
          AND ($10::timestamptz IS NULL OR (a.published_at, a.id) < ($10, $11))
        ORDER BY a.published_at DESC, a.id DESC
        LIMIT $12
        "#,
    )
    .bind(user.0.id)
    .bind(subscription_ids)
    .bind(folder_ids)
    .bind(tag_ids)
    .bind(filters.is_read)
    .bind(filters.read_later)
    .bind(q_pattern)
    .bind(from_date)
    .bind(to_date)
    .bind(cursor.map(|c| c.0))
    .bind(cursor.map(|c| c.1).unwrap_or(Uuid::nil()))
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::from)?;

    let next_cursor = rows.last().map(|a| encode_cursor(a.published_at, a.id));
    Ok(Json(serde_json::json!({ "items": rows, "next_cursor": next_cursor })))
}

#[get("/articles/<id>")]
async fn get_article(state: &rocket::State<AppState>, user: CurrentUser, id: Uuid) -> Result<Json<Value>, AppError> {
    let a = sqlx::query_as::<_, crate::models::Article>(
        r#"
        SELECT a.id, a.canonical_url, a.title, a.author, a.summary, a.content, a.source_tags,
               a.media_url, a.platform_metadata, a.published_at, a.created_at
        FROM content.articles a
        JOIN personalization.user_articles ua ON ua.article_id = a.id
        WHERE a.id = $1 AND ua.user_id = $2
        "#,
    )
    .bind(id)
    .bind(user.0.id)
    .fetch_optional(&state.db)
    .await
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::NotFound("article not found".into()))?;

    sqlx::query("UPDATE personalization.user_articles SET is_read = true, read_at = now() WHERE user_id = $1 AND article_id = $2 AND is_read = false")
        .bind(user.0.id)
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(AppError::from)?;

    Ok(Json(serde_json::json!(a)))
}

#[derive(Deserialize)]
struct ArticleUpdateRequest {
    is_read: Option<bool>,
    read_later: Option<bool>,
    tag_ids: Option<Vec<Uuid>>,
}

#[put("/articles/<id>", data = "<body>")]
async fn update_article(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    id: Uuid,
    body: Json<ArticleUpdateRequest>,
) -> Result<Json<Value>, AppError> {
    if body.is_read.is_some() || body.read_later.is_some() {
        sqlx::query(
            r#"
            UPDATE personalization.user_articles
            SET is_read = coalesce($3, is_read),
                read_later = coalesce($4, read_later),
                read_at = CASE WHEN $3 = true THEN now() ELSE read_at END
            WHERE user_id = $1 AND article_id = $2
            "#,
        )
        .bind(user.0.id)
        .bind(id)
        .bind(body.is_read)
        .bind(body.read_later)
        .execute(&state.db)
        .await
        .map_err(AppError::from)?;
    }
    if let Some(tag_ids) = &body.tag_ids {
        tag::sync_article_tags(&state.db, user.0.id, id, tag_ids).await?;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct MarkAsReadRequest {
    subscription_ids: Option<Vec<Uuid>>,
    folder_ids: Option<Vec<Uuid>>,
}

#[post("/articles/mark-as-read", data = "<body>")]
async fn mark_as_read(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    body: Json<MarkAsReadRequest>,
) -> Result<Json<Value>, AppError> {
    sqlx::query(
        r#"
        UPDATE personalization.user_articles ua
        SET is_read = true, read_at = now()
        FROM content.article_sources src
        JOIN personalization.subscriptions s ON s.feed_id = src.feed_id
        WHERE ua.article_id = src.article_id
          AND s.user_id = $1 AND ua.user_id = $1
          AND ($2::uuid[] IS NULL OR s.id = ANY($2))
          AND ($3::uuid[] IS NULL OR s.folder_id = ANY($3))
          AND ua.is_read = false
        "#,
    )
    .bind(user.0.id)
    .bind(body.subscription_ids.as_deref())
    .bind(body.folder_ids.as_deref())
    .execute(&state.db)
    .await
    .map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- Feeds / discover ------------------------------------------------------

#[get("/feeds")]
async fn list_feeds(state: &rocket::State<AppState>, user: CurrentUser) -> Result<Json<Value>, AppError> {
    let subs = sqlx::query_as::<_, crate::models::Subscription>(
        r#"
        SELECT id, user_id, feed_id, title_override, folder_id, pinned, is_active, unread_count, import_id, created_at
        FROM personalization.subscriptions WHERE user_id = $1 AND is_active = true
        ORDER BY created_at DESC
        "#,
    )
    .bind(user.0.id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::from)?;
    Ok(Json(serde_json::json!(subs)))
}

#[derive(Deserialize)]
struct FeedUpdateRequest {
    title_override: Option<String>,
    folder_id: Option<Option<Uuid>>,
    pinned: Option<bool>,
}

#[put("/feeds/<id>", data = "<body>")]
async fn update_feed(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    id: Uuid,
    body: Json<FeedUpdateRequest>,
) -> Result<Json<Value>, AppError> {
    sqlx::query(
        r#"
        UPDATE personalization.subscriptions
        SET title_override = coalesce($3, title_override),
            folder_id = CASE WHEN $4 THEN $5 ELSE folder_id END,
            pinned = coalesce($6, pinned)
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(id)
    .bind(user.0.id)
    .bind(&body.title_override)
    .bind(body.folder_id.is_some())
    .bind(body.folder_id.flatten())
    .bind(body.pinned)
    .execute(&state.db)
    .await
    .map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[delete("/feeds/<id>")]
async fn delete_feed(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, id: Uuid) -> Result<Json<Value>, AppError> {
    let removed = subscription::unsubscribe(&state.db, user.0.id, id).await.map_err(AppError::from)?;
    if !removed {
        return Err(AppError::NotFound("subscription not found".into()));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct DiscoverRequest {
    url: String,
    folder_id: Option<Uuid>,
}

#[post("/discover", data = "<body>")]
async fn discover(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    body: Json<DiscoverRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = feed::discover_and_subscribe(&state.db, &state.redis, user.0.id, &body.url, body.folder_id).await?;
    let response = match outcome {
        feed::DiscoverOutcome::Existing => serde_json::json!({ "status": "existing" }),
        feed::DiscoverOutcome::Moved => serde_json::json!({ "status": "moved" }),
        feed::DiscoverOutcome::Subscribed => serde_json::json!({ "status": "subscribed" }),
        feed::DiscoverOutcome::Pending { job_id } => serde_json::json!({ "status": "pending", "job_id": job_id }),
    };
    Ok(Json(response))
}

// --- Folders ---------------------------------------------------------------

#[get("/folders/tree")]
async fn folder_tree(state: &rocket::State<AppState>, user: CurrentUser) -> Result<Json<Value>, AppError> {
    let tree = folder::get_folder_tree(&state.db, user.0.id).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!(tree)))
}

#[derive(Deserialize)]
struct CreateFolderRequest {
    name: String,
    parent_id: Option<Uuid>,
}

#[post("/folders", data = "<body>")]
async fn create_folder(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    body: Json<CreateFolderRequest>,
) -> Result<Json<Value>, AppError> {
    let folders_cfg = state.config.folders.clone().unwrap_or(common::FoldersConfig {
        max_depth: None,
        max_per_parent: None,
        max_name_length: None,
    });
    let created = folder::create_folder(
        &state.db,
        user.0.id,
        &body.name,
        body.parent_id,
        folders_cfg.max_depth(),
        folders_cfg.max_per_parent() as i32,
        folders_cfg.max_name_length(),
    )
    .await?;
    Ok(Json(serde_json::json!(created)))
}

#[derive(Deserialize)]
struct UpdateFolderRequest {
    name: Option<String>,
    parent_id: Option<Option<Uuid>>,
}

#[put("/folders/<id>", data = "<body>")]
async fn update_folder(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    id: Uuid,
    body: Json<UpdateFolderRequest>,
) -> Result<Json<Value>, AppError> {
    let folders_cfg = state.config.folders.clone().unwrap_or(common::FoldersConfig {
        max_depth: None,
        max_per_parent: None,
        max_name_length: None,
    });
    let updated = folder::update_folder(
        &state.db,
        user.0.id,
        id,
        body.name.as_deref(),
        body.parent_id,
        folders_cfg.max_depth(),
        folders_cfg.max_name_length(),
    )
    .await?;
    Ok(Json(serde_json::json!(updated)))
}

#[delete("/folders/<id>")]
async fn delete_folder(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, id: Uuid) -> Result<Json<Value>, AppError> {
    folder::delete_folder(&state.db, user.0.id, id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- Tags --------------------------------------------------------------

#[get("/tags?<limit>&<offset>")]
async fn list_tags(state: &rocket::State<AppState>, user: CurrentUser, limit: Option<i64>, offset: Option<i64>) -> Result<Json<Value>, AppError> {
    let tags = tag::get_user_tags(&state.db, user.0.id, limit.unwrap_or(100), offset.unwrap_or(0)).await?;
    Ok(Json(serde_json::json!(tags)))
}

#[derive(Deserialize)]
struct TagRequest {
    name: String,
}

#[post("/tags", data = "<body>")]
async fn create_tag(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, body: Json<TagRequest>) -> Result<Json<Value>, AppError> {
    let max_len = state.config.tags.clone().unwrap_or(common::TagsConfig { max_name_length: None }).max_name_length();
    let created = tag::create_user_tag(&state.db, user.0.id, &body.name, max_len).await?;
    Ok(Json(serde_json::json!(created)))
}

#[put("/tags/<id>", data = "<body>")]
async fn update_tag(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    id: Uuid,
    body: Json<TagRequest>,
) -> Result<Json<Value>, AppError> {
    let max_len = state.config.tags.clone().unwrap_or(common::TagsConfig { max_name_length: None }).max_name_length();
    let updated = tag::update_user_tag(&state.db, user.0.id, id, &body.name, max_len).await?;
    Ok(Json(serde_json::json!(updated)))
}

#[delete("/tags/<id>")]
async fn delete_tag(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, id: Uuid) -> Result<Json<Value>, AppError> {
    tag::delete_user_tag(&state.db, user.0.id, id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- OPML ----------------------------------------------------------------

#[post("/opml/upload?<folder_id>", data = "<file>")]
async fn opml_upload(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    folder_id: Option<Uuid>,
    file: Data<'_>,
) -> Result<Json<Value>, AppError> {
    let storage_cfg = state.config.storage.clone().unwrap_or(common::StorageConfig {
        path: None,
        opml_file_expiry_hours: None,
        opml_max_file_size_bytes: None,
    });
    let max_bytes = storage_cfg.opml_max_file_size_bytes();
    let bytes = file
        .open(max_bytes.bytes())
        .into_bytes()
        .await
        .map_err(|e| AppError::Validation(format!("failed to read upload: {e}")))?;
    let contents = String::from_utf8(bytes.into_inner()).map_err(|_| AppError::Validation("upload is not valid UTF-8".into()))?;

    let opml_cfg = state.config.opml.clone().unwrap_or(common::OpmlConfig { max_nesting_depth: None, max_outlines: None });
    opml::validate_opml_upload(
        "upload.opml",
        &contents,
        max_bytes as usize,
        opml_cfg.max_nesting_depth() as usize,
        opml_cfg.max_outlines() as usize,
    )?;

    let import_id = Uuid::new_v4();
    let key = crate::files::import_key(user.0.id, "upload", import_id);
    let record = opml::create_import_record(&state.db, import_id, user.0.id, "upload.opml", &key)
        .await
        .map_err(AppError::from)?;
    crate::files::write(storage_cfg.path(), &key, &contents).await.map_err(AppError::from)?;

    let payload = serde_json::json!({
        "user_id": user.0.id,
        "import_id": record.id,
        "contents": contents,
        "filename": "upload.opml",
        "folder_id": folder_id,
    });
    let job_id = job::publish_job(&state.redis, "opml_import", payload).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "import_id": record.id, "job_id": job_id })))
}

#[post("/opml/export")]
async fn opml_export(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected) -> Result<Json<Value>, AppError> {
    let payload = serde_json::json!({ "user_id": user.0.id });
    let job_id = job::publish_job(&state.redis, "opml_export", payload).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

#[get("/opml/status/<id>")]
async fn opml_status(state: &rocket::State<AppState>, user: CurrentUser, id: Uuid) -> Result<Json<Value>, AppError> {
    let status = opml::get_import_status(&state.db, user.0.id, id).await?;
    Ok(Json(serde_json::json!(status)))
}

#[post("/opml/<id>/rollback")]
async fn opml_rollback(state: &rocket::State<AppState>, user: CurrentUser, _csrf: CsrfProtected, id: Uuid) -> Result<Json<Value>, AppError> {
    let removed = subscription::rollback_import(&state.db, user.0.id, id).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[get("/opml/download/<filename>")]
async fn opml_download(state: &rocket::State<AppState>, user: CurrentUser, filename: &str) -> Result<Vec<u8>, AppError> {
    crate::files::validate_download_filename(filename).map_err(|e| AppError::Validation(e.to_string()))?;
    let storage_cfg = state.config.storage.clone().unwrap_or(common::StorageConfig {
        path: None,
        opml_file_expiry_hours: None,
        opml_max_file_size_bytes: None,
    });
    let key = crate::files::export_key(user.0.id, filename);
    let mtime = crate::files::mtime(storage_cfg.path(), &key).await.map_err(|_| AppError::NotFound("file not found".into()))?;
    if opml::is_export_expired(mtime, storage_cfg.opml_file_expiry_hours()) {
        return Err(AppError::NotFound("export expired".into()));
    }
    crate::files::read(storage_cfg.path(), &key).await.map_err(|_| AppError::NotFound("file not found".into()))
}

// --- Search ----------------------------------------------------------------

#[get("/search?<q>")]
async fn universal_search(state: &rocket::State<AppState>, user: CurrentUser, q: &str) -> Json<Value> {
    let hits = search::universal_search(&state.db, user.0.id, q).await;
    Json(serde_json::json!({ "results": hits }))
}

#[get("/search/articles?<q>")]
async fn search_articles(state: &rocket::State<AppState>, user: CurrentUser, q: &str) -> Result<Json<Value>, AppError> {
    let hits = search::search_by_type(&state.db, user.0.id, search::EntityType::Article, q).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

#[get("/search/feeds?<q>")]
async fn search_feeds(state: &rocket::State<AppState>, user: CurrentUser, q: &str) -> Result<Json<Value>, AppError> {
    let hits = search::search_by_type(&state.db, user.0.id, search::EntityType::Feed, q).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

#[get("/search/tags?<q>")]
async fn search_tags(state: &rocket::State<AppState>, user: CurrentUser, q: &str) -> Result<Json<Value>, AppError> {
    let hits = search::search_by_type(&state.db, user.0.id, search::EntityType::Tag, q).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

#[get("/search/folders?<q>")]
async fn search_folders(state: &rocket::State<AppState>, user: CurrentUser, q: &str) -> Result<Json<Value>, AppError> {
    let hits = search::search_by_type(&state.db, user.0.id, search::EntityType::Folder, q).await.map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

// --- Me / preferences --------------------------------------------------

#[get("/me")]
fn me(user: CurrentUser) -> Json<Value> {
    Json(serde_json::json!({ "id": user.0.id, "username": user.0.username, "is_admin": user.0.is_admin }))
}

#[get("/me/preferences")]
async fn get_preferences(state: &rocket::State<AppState>, user: CurrentUser) -> Result<Json<Value>, AppError> {
    let prefs = preferences::get_preferences(&state.db, user.0.id).await?;
    Ok(Json(prefs))
}

#[put("/me/preferences", data = "<body>")]
async fn update_preferences(
    state: &rocket::State<AppState>,
    user: CurrentUser,
    _csrf: CsrfProtected,
    body: Json<Value>,
) -> Result<Json<Value>, AppError> {
    let prefs = preferences::update_preferences(&state.db, user.0.id, &body).await?;
    Ok(Json(prefs))
}

// --- Request guards for headers/peer address ----------------------------

struct SocketAddrGuard(IpAddr);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SocketAddrGuard {
    type Error = std::convert::Infallible;
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req.client_ip().unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
        Outcome::Success(SocketAddrGuard(ip))
    }
}

struct HeaderGuard {
    xff: Option<String>,
    xri: Option<String>,
    user_agent: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for HeaderGuard {
    type Error = std::convert::Infallible;
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(HeaderGuard {
            xff: req.headers().get_one("X-Forwarded-For").map(String::from),
            xri: req.headers().get_one("X-Real-IP").map(String::from),
            user_agent: req.headers().get_one("User-Agent").map(String::from),
        })
    }
}

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    common::run_migrations(pool).await
}

pub async fn launch_rocket(db: PgPool, redis: redis::Client, config: Config) -> Result<()> {
    let trusted_proxies = config
        .network
        .as_ref()
        .map(|n| n.trusted_proxies().iter().filter_map(|s| auth::CidrBlock::parse(s)).collect())
        .unwrap_or_default();
    let bind_address = config.network.as_ref().map(|n| n.bind_address().to_string()).unwrap_or_else(|| "0.0.0.0".into());
    let port = config.network.as_ref().map(|n| n.port()).unwrap_or(8000);

    let state = AppState { db, redis, config, trusted_proxies };

    let figment = rocket::Config::figment()
        .merge(("address", bind_address))
        .merge(("port", port));

    let rocket = rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                register,
                login,
                logout,
                change_password,
                list_sessions,
                revoke_session,
                list_articles,
                get_article,
                update_article,
                mark_as_read,
                list_feeds,
                update_feed,
                delete_feed,
                discover,
                folder_tree,
                create_folder,
                update_folder,
                delete_folder,
                list_tags,
                create_tag,
                update_tag,
                delete_tag,
                opml_upload,
                opml_export,
                opml_status,
                opml_rollback,
                opml_download,
                universal_search,
                search_articles,
                search_feeds,
                search_tags,
                search_folders,
                me,
                get_preferences,
                update_preferences,
            ],
        );

    rocket.launch().await.map(|_| ()).map_err(|e| anyhow::anyhow!("rocket launch failed: {e}"))
}
