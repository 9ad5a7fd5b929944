use thiserror::Error;

use crate::cache::CacheError;
use crate::dispatch::BrokerError;
use crate::indexer::IndexError;
use crate::storage::StoreError;

/// Failure class of a transcode operation. The retry controller only looks at
/// this to decide whether another attempt can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscodeErrorKind {
    /// Malformed request, e.g. an unsupported resolution label.
    Validation,
    Forbidden,
    /// The source media (or a requested rendition) does not exist.
    NotFound,
    /// Another encode for the same video is queued or running.
    Conflict,
    /// The host is missing something an operator has to install.
    Environment,
    /// Process crash, timeout, I/O hiccup.
    Transient,
}

impl TranscodeErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            TranscodeErrorKind::Validation => 400,
            TranscodeErrorKind::Forbidden => 403,
            TranscodeErrorKind::NotFound => 404,
            TranscodeErrorKind::Conflict => 409,
            TranscodeErrorKind::Environment | TranscodeErrorKind::Transient => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeErrorKind::Validation => "validation",
            TranscodeErrorKind::Forbidden => "forbidden",
            TranscodeErrorKind::NotFound => "not_found",
            TranscodeErrorKind::Conflict => "conflict",
            TranscodeErrorKind::Environment => "environment",
            TranscodeErrorKind::Transient => "transient",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TranscodeError {
    kind: TranscodeErrorKind,
    message: String,
}

impl TranscodeError {
    pub fn new(kind: TranscodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::NotFound, message)
    }

    pub fn conflict() -> Self {
        Self::new(
            TranscodeErrorKind::Conflict,
            "Transcode already in progress.",
        )
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::Environment, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::Transient, message)
    }

    pub fn kind(&self) -> TranscodeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Permanent errors are raised on the first attempt: 400/403/404/409 can
    /// not be fixed by waiting, and a missing binary needs an operator.
    pub fn is_permanent(&self) -> bool {
        matches!(self.status_code(), 400 | 403 | 404 | 409)
            || self.kind == TranscodeErrorKind::Environment
    }
}

impl From<CacheError> for TranscodeError {
    fn from(error: CacheError) -> Self {
        TranscodeError::transient(format!("transcode state unavailable: {error}"))
    }
}

impl From<StoreError> for TranscodeError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownResolution(_) | StoreError::InvalidName(_) => {
                TranscodeError::validation(error.to_string())
            }
            StoreError::NotFound(_) => TranscodeError::not_found(error.to_string()),
            other => TranscodeError::transient(format!("rendition store error: {other}")),
        }
    }
}

impl From<BrokerError> for TranscodeError {
    fn from(error: BrokerError) -> Self {
        TranscodeError::transient(format!("broker error: {error}"))
    }
}

impl From<IndexError> for TranscodeError {
    fn from(error: IndexError) -> Self {
        TranscodeError::transient(format!("index error: {error}"))
    }
}

impl From<tokio::task::JoinError> for TranscodeError {
    fn from(error: tokio::task::JoinError) -> Self {
        TranscodeError::transient(format!("background task failed: {error}"))
    }
}

impl From<std::io::Error> for TranscodeError {
    fn from(error: std::io::Error) -> Self {
        TranscodeError::transient(format!("io error: {error}"))
    }
}

pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;
