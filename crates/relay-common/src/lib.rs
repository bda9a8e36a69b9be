//! Error type and settings shared across the relay workspace.

pub type Result<T> = core::result::Result<T, RelayError>;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("shard configuration error: {0}")]
    ShardConfig(String),
    #[error("{0}")]
    Internal(String),
}

pub mod config;
