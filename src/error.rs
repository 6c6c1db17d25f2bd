//! # Error Handling
//!
//! Two layers live here. [`Error`] is the domain taxonomy every engine
//! operation returns; [`ApiError`] is the problem+json envelope the HTTP surface
//! renders, with trace ID propagation.

use std::fmt;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::crypto::CryptoError;
use crate::telemetry;

/// Provider round trip that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStep {
    Exchange,
    Refresh,
    Revoke,
}

impl fmt::Display for ProviderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderStep::Exchange => "token exchange",
            ProviderStep::Refresh => "token refresh",
            ProviderStep::Revoke => "token revocation",
        })
    }
}

/// Domain errors for the connection and token lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("consistency violation: {0}")]
    Violation(String),

    /// `detail` is a truncated provider error snippet, never token material.
    #[error("provider {step} failed (status {status:?}): {detail}")]
    Provider {
        step: ProviderStep,
        status: Option<u16>,
        detail: String,
    },

    #[error("timed out acquiring lock '{name}'")]
    LockTimeout { name: String },

    /// Callback failures; the reason is for logs only.
    #[error("authorization failed")]
    AuthorizationFailed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("ephemeral store error: {0}")]
    Ephemeral(String),

    #[error("task queue error: {0}")]
    Queue(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn provider(step: ProviderStep, status: Option<u16>, body: impl AsRef<str>) -> Self {
        Error::Provider {
            step,
            status,
            detail: truncate_snippet(body.as_ref()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether a caller may retry the same operation later without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout { .. } | Error::Ephemeral(_) => true,
            Error::Provider { status, .. } => match status {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }
}

/// Truncates provider bodies to 200 characters on a char boundary.
fn truncate_snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// True for unique-constraint violations on Postgres and SQLite.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    match db_error.code() {
        Some(code) => code.as_ref() == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()),
        None => false,
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::NotFound { entity, .. } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{} not found", entity),
            ),
            Error::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
            }
            Error::AuthorizationFailed(reason) => {
                tracing::warn!(reason = %reason, "OAuth2 callback rejected");
                Self::new(
                    StatusCode::BAD_REQUEST,
                    "AUTHORIZATION_FAILED",
                    "authorization failed",
                )
            }
            Error::Provider {
                step,
                status,
                detail,
            } => {
                tracing::warn!(%step, ?status, "Provider call failed");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "PROVIDER_ERROR",
                    &format!("Provider {} failed", step),
                )
                .with_details(json!({ "step": step, "status": status, "body_snippet": detail }))
            }
            Error::LockTimeout { name } => {
                tracing::warn!(lock = %name, "Lock acquisition timed out");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "LOCK_TIMEOUT",
                    "Operation in progress, retry shortly",
                )
                .with_retry_after(5)
            }
            Error::Ephemeral(_) | Error::Queue(_) => {
                tracing::error!(error = %error, "Coordination backend failure");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Service temporarily unavailable",
                )
            }
            Error::Violation(_) | Error::Crypto(_) | Error::Database(_) => {
                tracing::error!(error = %error, "Internal error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
