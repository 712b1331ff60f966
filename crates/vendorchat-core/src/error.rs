use thiserror::Error;
use vendorchat_api::ValidationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unavailable {0}")]
    Unavailable(String),
    #[error("rejected {0}")]
    Rejected(String),
    #[error("cursor rejected")]
    CursorRejected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("not found {0}")]
    NotFound(String),
    #[error("validation {0}")]
    Validation(#[from] ValidationError),
    #[error("transport {0}")]
    Transport(#[from] TransportError),
}
