use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("invalid date: {input:?}")]
    Invalid { input: String },

    #[error("month out of range: {0}")]
    MonthOutOfRange(u32),

    #[error("date out of supported range: {month}/{year}")]
    OutOfRange { month: u32, year: i32 },
}

impl DateError {
    pub fn invalid(input: impl Into<String>) -> Self {
        Self::Invalid {
            input: input.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("remote responded with {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed decoding remote payload: {0}")]
    Decode(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error(transparent)]
    InvalidDate(#[from] DateError),

    #[error("another availability update is still in flight")]
    Busy,

    #[error("availability update failed and was reverted: {0}")]
    Remote(#[from] RemoteError),
}

impl SelectionError {
    /// Whether re-issuing the same toggle can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SelectionError::Busy | SelectionError::Remote(_))
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid form: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Validation(Vec<ValidationError>),

    #[error("email already in use")]
    EmailTaken,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<ValidationError> for AccountError {
    fn from(err: ValidationError) -> Self {
        AccountError::Validation(vec![err])
    }
}
