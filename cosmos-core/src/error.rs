//! Cosmos error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The requested resource was not found.
    #[error("the requested resource was not found")]
    ResourceNotFound,
    /// No active control stream exists for the target agent.
    #[error("no active stream for agent {0}")]
    NoStream(String),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(#[source] anyhow::Error),
}
