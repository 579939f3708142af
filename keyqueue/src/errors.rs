use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// No key is currently claimable. Back off and poll again.
    #[error("no claimable key in the queue")]
    EmptyQueue,
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("config error: {0}")]
    Config(#[from] confy::ConfyError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl QueueError {
    #[inline]
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, QueueError::EmptyQueue)
    }
}
