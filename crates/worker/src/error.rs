use igloo_common::{OutputBufferId, TaskId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid identifier")]
    Id(#[from] igloo_common::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Output buffers of type {existing} cannot be reinitialized as {requested}")]
    BufferTypeMismatch { existing: String, requested: String },

    #[error("Buffer id {0} is not declared and no more buffer ids can be added")]
    UnknownBuffer(OutputBufferId),

    #[error("Buffer id {buffer_id}: token {token} is outside the retained range {low}..={high}")]
    InvalidToken {
        buffer_id: OutputBufferId,
        token: u64,
        low: u64,
        high: u64,
    },

    #[error("Output buffer routing failed: {0}")]
    Routing(String),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
