use thiserror::Error;

use crate::policy::FailureKind;
use crate::types::UserId;

/// Errors surfaced by the registry, dispatcher and stores.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("device token is not owned by user {user_id}")]
    Ownership { user_id: UserId },

    #[error("device token not found")]
    NotFound,

    #[error("transient delivery failure [{code}]: {message}")]
    TransientDelivery { code: String, message: String },

    #[error("permanent delivery failure [{code}]: {message}")]
    PermanentDelivery { code: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("conflicting active registration for token")]
    Conflict,

    #[error("token lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PushError>;

impl PushError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Ownership { .. } => "OWNERSHIP_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::TransientDelivery { .. } => "TRANSIENT_DELIVERY_ERROR",
            Self::PermanentDelivery { .. } => "PERMANENT_DELIVERY_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Conflict => "CONFLICT",
            Self::Lock(_) => "LOCK_ERROR",
        }
    }

    /// Failure Policy category, when the error belongs to one.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Validation(_) => Some(FailureKind::Validation),
            Self::Ownership { .. } => Some(FailureKind::Ownership),
            Self::TransientDelivery { .. } => Some(FailureKind::Transient),
            Self::PermanentDelivery { .. } => Some(FailureKind::Permanent),
            Self::Cancelled => Some(FailureKind::Cancelled),
            Self::NotFound | Self::Storage(_) | Self::Conflict | Self::Lock(_) => None,
        }
    }
}

impl From<diesel::result::Error> for PushError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::NotFound => Self::NotFound,
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => Self::Conflict,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for PushError {
    fn from(err: redis::RedisError) -> Self {
        Self::Lock(err.to_string())
    }
}

/// Failure reported by a push gateway.
///
/// `code` is the gateway's own error identifier (`Unregistered`,
/// `registration-token-not-registered`, `UNAVAILABLE`, ...) and is what the
/// Failure Policy classifies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
