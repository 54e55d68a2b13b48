//! Surface-visible error taxonomy (§7). Application services raise these;
//! the HTTP surface (`server`) maps them to status codes via `Responder`.
//! Worker functions match on the same enum to decide retry/notify behavior.

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde_json::json;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid password: {0}")]
    InvalidPassword(String),

    #[error("folder limit exceeded (depth={depth}, folder_count={folder_count})")]
    FolderLimit { depth: i32, folder_count: i32 },

    #[error("circular reference")]
    CircularReference,

    #[error("upstream error: {kind}")]
    Upstream { kind: UpstreamErrorKind },

    #[error("fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    NoFeedData,
    NoEntries,
    ParsingError,
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamErrorKind::NoFeedData => "no_feed_data",
            UpstreamErrorKind::NoEntries => "no_entries",
            UpstreamErrorKind::ParsingError => "parsing_error",
        };
        write!(f, "{s}")
    }
}

impl AppError {
    pub fn status(&self) -> Status {
        match self {
            AppError::Validation(_) => Status::BadRequest,
            AppError::NotFound(_) => Status::NotFound,
            AppError::Conflict(_) => Status::Conflict,
            AppError::InvalidCredentials => Status::Unauthorized,
            AppError::InvalidPassword(_) => Status::BadRequest,
            AppError::FolderLimit { .. } => Status::BadRequest,
            AppError::CircularReference => Status::BadRequest,
            AppError::Upstream { .. } => Status::BadGateway,
            AppError::Fatal(_) => Status::InternalServerError,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            AppError::FolderLimit { depth, folder_count } => json!({
                "error": "folder_limit",
                "depth": depth,
                "folder_count": folder_count,
            }),
            AppError::Upstream { kind } => json!({
                "error": "upstream_error",
                "kind": kind.to_string(),
            }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

impl<'r> Responder<'r, 'static> for AppError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let body = self.body().to_string();
        tracing::warn!(%status, error = %self, "request failed");
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

/// Worker functions and application services that sit below Rocket use
/// `anyhow::Result`; this converts unexpected (non-domain) failures into
/// the catch-all `Fatal` kind at the boundary where a `Responder` is owed.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Fatal(e.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".into()),
            other => AppError::Fatal(other.to_string()),
        }
    }
}
