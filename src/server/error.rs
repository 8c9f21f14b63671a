//! HTTP error responses.
//!
//! Every failure surfaces as a JSON body `{"error": "..."}` with a status
//! that distinguishes caller mistakes from upstream-model trouble. Upstream
//! failures map to 502 so clients can tell "you did something wrong" from
//! "try again in a minute".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::objects::ObjectError;
use crate::rag::assistant::AssistantError;
use crate::rag::ingest::IngestError;
use crate::rag::usage::UsageError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Unsupported media type")]
    UnsupportedMediaType,

    #[error("Document contains too little text to index")]
    InsufficientContent,

    #[error("Daily question limit reached")]
    RateLimited {
        query_count: i64,
        daily_limit: i64,
        reset_time: DateTime<Utc>,
    },

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::InsufficientContent => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        let body = match &self {
            ApiError::RateLimited {
                query_count,
                daily_limit,
                reset_time,
            } => json!({
                "error": self.to_string(),
                "queryCount": query_count,
                "dailyLimit": daily_limit,
                "resetTime": reset_time,
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::Unauthorized
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DocumentNotFound(id) => ApiError::NotFound(format!("Document {id} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ObjectError> for ApiError {
    fn from(e: ObjectError) -> Self {
        match e {
            ObjectError::NotFound(_) => ApiError::NotFound("Object not found".to_string()),
            ObjectError::InvalidPath(msg) => ApiError::Validation(msg),
            ObjectError::NamespaceMismatch(_) => ApiError::Forbidden,
            ObjectError::BadSignature(_) => ApiError::Forbidden,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::SourceNotFound(msg) => ApiError::NotFound(msg),
            IngestError::UnsupportedMediaType => ApiError::UnsupportedMediaType,
            IngestError::InsufficientContent => ApiError::InsufficientContent,
            IngestError::Pdf(e) => ApiError::Validation(format!("Unreadable PDF: {e}")),
            IngestError::Embedding(e) => ApiError::Upstream(e.to_string()),
            IngestError::Store(e) => e.into(),
            IngestError::Object(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AssistantError> for ApiError {
    fn from(e: AssistantError) -> Self {
        match e {
            AssistantError::Validation(msg) => ApiError::Validation(msg),
            AssistantError::RateLimitExceeded {
                query_count,
                daily_limit,
                reset_time,
            } => ApiError::RateLimited {
                query_count,
                daily_limit,
                reset_time,
            },
            AssistantError::Embedding(e) => ApiError::Upstream(e.to_string()),
            AssistantError::Generation(e) => ApiError::Upstream(e.to_string()),
            // Retrieval runs locally, so its failures are server faults,
            // not bad gateways.
            AssistantError::Retrieval(e) => ApiError::Internal(e.to_string()),
            AssistantError::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<UsageError> for ApiError {
    fn from(e: UsageError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
