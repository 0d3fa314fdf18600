//! Error types for bucket actors.

use lode_cluster::GridError;
use thiserror::Error;

/// Errors returned when talking to a bucket actor.
#[derive(Debug, Error)]
pub enum BucketError {
    /// The bucket task is no longer running (channel closed).
    #[error("bucket unavailable")]
    Unavailable,
}

impl From<BucketError> for GridError {
    fn from(err: BucketError) -> Self {
        GridError::Unavailable(err.to_string())
    }
}
