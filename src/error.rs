use std::io::Cursor;
use log::error;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use sqlx::error::ErrorKind;
use thiserror::Error;

/// Error taxonomy exposed to callers. Every route returns one of these kinds
/// plus a human readable message; business rejections (`Conflict`,
/// `Validation`) are kept distinct from invariant breaches
/// (`InternalConsistency`) and from retryable store failures (`Transient`).
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    InternalConsistency(String),
    #[error("{0}")]
    Transient(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }
    pub fn internal_consistency(msg: impl Into<String>) -> Self {
        Self::InternalConsistency(msg.into())
    }
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Authorization(_) => "authorization",
            Self::InternalConsistency(_) => "internal_consistency",
            Self::Transient(_) => "transient",
        }
    }
    fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::Conflict(_) => Status::Conflict,
            Self::Validation(_) => Status::BadRequest,
            Self::Authorization(_) => Status::Unauthorized,
            Self::InternalConsistency(_) => Status::InternalServerError,
            Self::Transient(_) => Status::ServiceUnavailable,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation => {
                    ApiError::Conflict(format!("Unique constraint violated: {db}"))
                }
                ErrorKind::CheckViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation => {
                    ApiError::InternalConsistency(format!("Store constraint violated: {db}"))
                }
                // SQLITE_BUSY and friends end up here, safe to retry from scratch
                _ => ApiError::Transient(format!("Database error: {db}")),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                ApiError::Transient("Database connection timed out".to_string())
            }
            sqlx::Error::Io(e) => ApiError::Transient(format!("Database I/O error: {e}")),
            other => ApiError::Transient(format!("Database error: {other}")),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            error!("{}: {self}", self.kind());
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
        .to_string();
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
