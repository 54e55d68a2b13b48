//! Domain types shared across modules. Every entity is keyed by UUID per
//! the data model: feeds and articles are global, the rest are scoped to a
//! user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub cookie_hash: String,
    pub expires_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum FeedType {
    Rss,
    Atom,
    Rdf,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feed {
    pub id: Uuid,
    pub canonical_url: String,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub website: Option<String>,
    pub feed_type: FeedType,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_count: i32,
    pub is_active: bool,
    /// Most recent article ids first, bounded. Used for subscribe-backfill.
    pub latest_articles: Value,
    pub created_at: DateTime<Utc>,
}

/// Health state derived per §4.F; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Healthy,
    Stale,
    Error,
}

impl Feed {
    pub fn status(&self, now: DateTime<Utc>) -> FeedStatus {
        let fresh = |t: DateTime<Utc>| now.signed_duration_since(t) < chrono::Duration::hours(1);
        match (self.last_error_at, self.last_fetched_at) {
            (None, None) => FeedStatus::Stale,
            (Some(err), Some(fetch)) => {
                if err > fetch {
                    FeedStatus::Error
                } else if fresh(fetch) {
                    FeedStatus::Healthy
                } else {
                    FeedStatus::Stale
                }
            }
            (Some(_), None) => FeedStatus::Error,
            (None, Some(fetch)) => {
                if fresh(fetch) {
                    FeedStatus::Healthy
                } else {
                    FeedStatus::Stale
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub feed_id: Uuid,
    pub title_override: Option<String>,
    pub folder_id: Option<Uuid>,
    pub pinned: bool,
    pub is_active: bool,
    pub unread_count: i32,
    pub import_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Folder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub depth: i32,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub id: Uuid,
    pub canonical_url: String,
    pub title: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub source_tags: Value,
    pub media_url: Option<String>,
    pub platform_metadata: Value,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArticleSource {
    pub article_id: Uuid,
    pub feed_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserArticle {
    pub user_id: Uuid,
    pub article_id: Uuid,
    pub is_read: bool,
    pub read_later: bool,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTag {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub article_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArticleTag {
    pub user_id: Uuid,
    pub article_id: Uuid,
    pub user_tag_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum OpmlStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OpmlImport {
    pub id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub storage_key: String,
    pub status: OpmlStatus,
    pub total: i32,
    pub imported: i32,
    pub failed: i32,
    pub duplicate: i32,
    pub failed_feeds_log: Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Lives in Q (Redis), not S. Serialized as JSON under key `job:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserPreferences {
    pub user_id: Uuid,
    pub preferences: Value,
}
