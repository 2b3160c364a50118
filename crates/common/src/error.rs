use thiserror::Error;

/// Unified error type for Igloo crates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid identifier '{value}': {reason}")]
    InvalidId { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_id(value: &str, reason: impl Into<String>) -> Self {
        Error::InvalidId {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
