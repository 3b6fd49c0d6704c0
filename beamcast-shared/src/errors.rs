use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E3xxx: Signaling errors
/// - E8xxx: Stream metadata errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,

    // Signaling (E3xxx)
    DuplicateConnection,
    UnknownConnection,
    ResourceNotFound,
    AlreadyConnected,
    AlreadyPublishing,
    IncompatibleCapabilities,
    EngineUnavailable,
    InvalidRequest,

    // Streams (E8xxx)
    StreamNotFound,
    InvalidStreamStatus,
    StreamTerminated,
    InvalidJoinerType,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",

            // Signaling
            Self::DuplicateConnection => "E3001",
            Self::UnknownConnection => "E3002",
            Self::ResourceNotFound => "E3003",
            Self::AlreadyConnected => "E3004",
            Self::AlreadyPublishing => "E3005",
            Self::IncompatibleCapabilities => "E3006",
            Self::EngineUnavailable => "E3007",
            Self::InvalidRequest => "E3008",

            // Streams
            Self::StreamNotFound => "E8001",
            Self::InvalidStreamStatus => "E8002",
            Self::StreamTerminated => "E8003",
            Self::InvalidJoinerType => "E8004",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationError | Self::InvalidRequest
            | Self::IncompatibleCapabilities | Self::InvalidStreamStatus
            | Self::InvalidJoinerType => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::UnknownConnection | Self::ResourceNotFound
            | Self::StreamNotFound => StatusCode::NOT_FOUND,
            Self::DuplicateConnection | Self::AlreadyConnected
            | Self::AlreadyPublishing | Self::StreamTerminated => StatusCode::CONFLICT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known { code: ErrorCode, message: String },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known { code, message } => {
                let status = code.status_code();
                if status.is_server_error() {
                    tracing::error!(code = code.code(), "{message}");
                }
                (status, ApiErrorResponse::new(code.code(), message))
            }
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                let (code, message) = match err {
                    diesel::result::Error::NotFound => (ErrorCode::NotFound, "resource not found"),
                    _ => (ErrorCode::InternalError, "database error"),
                };
                (code.status_code(), ApiErrorResponse::new(code.code(), message))
            }
            AppError::Validation(msg) => {
                let code = ErrorCode::ValidationError;
                (code.status_code(), ApiErrorResponse::new(code.code(), msg))
            }
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
