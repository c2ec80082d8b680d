use thiserror::Error;

use crate::common::models::MessageId;

/// Failure of a REST call, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("device is offline")]
    Offline,
    #[error("resource not found")]
    NotFound,
    #[error("forbidden (status {0})")]
    Forbidden(u16),
    #[error("http status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::NotFound => Some(404),
            ApiError::Forbidden(status) => Some(*status),
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("frame send failed: {0}")]
    SendFailed(String),
    #[error("realtime channel disconnected")]
    Disconnected,
    #[error("invalid frame: {0}")]
    InvalidMessage(String),
    #[error("operation timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the sync engine handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync engine has stopped")]
    Closed,
    #[error("no thread is open")]
    NoActiveThread,
    #[error("message {0} is not in the open thread")]
    UnknownMessage(MessageId),
    #[error("message {0} is not confirmed by the server yet")]
    NotConfirmed(MessageId),
    #[error("message {0} has no failed send to retry")]
    NothingToRetry(MessageId),
}
