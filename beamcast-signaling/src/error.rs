use beamcast_shared::ErrorCode;
use serde::Serialize;

use crate::engine::{EngineError, MediaKind};
use crate::ids::{ConnectionId, ResourceKind, TransportId};

/// Everything a signaling step can fail with.
///
/// Errors are answered to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("connection '{0}' is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("connection '{0}' is not registered")]
    UnknownConnection(ConnectionId),

    #[error("{kind} '{id}' not found")]
    ResourceNotFound { kind: ResourceKind, id: String },

    #[error("transport '{0}' is already connected")]
    AlreadyConnected(TransportId),

    #[error("transport '{transport_id}' already carries a {kind} publisher")]
    AlreadyPublishing {
        transport_id: TransportId,
        kind: MediaKind,
    },

    #[error("capabilities cannot consume publisher '{0}'")]
    IncompatibleCapabilities(String),

    #[error("media engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("{0}")]
    InvalidRequest(String),
}

impl SignalError {
    pub fn not_found(kind: ResourceKind, id: impl std::fmt::Display) -> Self {
        Self::ResourceNotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateConnection(_) => ErrorCode::DuplicateConnection,
            Self::UnknownConnection(_) => ErrorCode::UnknownConnection,
            Self::ResourceNotFound { .. } => ErrorCode::ResourceNotFound,
            Self::AlreadyConnected(_) => ErrorCode::AlreadyConnected,
            Self::AlreadyPublishing { .. } => ErrorCode::AlreadyPublishing,
            Self::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            Self::EngineUnavailable(_) => ErrorCode::EngineUnavailable,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::ResourceNotFound { .. } => "resource_not_found",
            Self::AlreadyConnected(_) => "already_connected",
            Self::AlreadyPublishing { .. } => "already_publishing",
            Self::IncompatibleCapabilities(_) => "incompatible_capabilities",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().code(),
            message: self.to_string(),
        }
    }
}

impl From<EngineError> for SignalError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unknown { kind, id } => Self::ResourceNotFound { kind, id },
            EngineError::WrongDirection(id) => {
                Self::InvalidRequest(format!("transport '{id}' has the wrong direction"))
            }
            EngineError::InvalidHandshake(msg) => Self::InvalidRequest(msg),
            EngineError::UnsupportedCodec(msg) => Self::IncompatibleCapabilities(msg),
            EngineError::Unavailable(msg) => Self::EngineUnavailable(msg),
        }
    }
}

/// Body of the `error` push and of the `error` field of a failed ack.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

/// Ack body for a failed request: `{ "error": { "code", "message" } }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorAck {
    pub error: ErrorPayload,
}

impl From<&SignalError> for ErrorAck {
    fn from(err: &SignalError) -> Self {
        Self {
            error: err.payload(),
        }
    }
}
