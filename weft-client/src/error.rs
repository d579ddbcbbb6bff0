//! Client error types

use thiserror::Error;
use weft_io::NetError;
use weft_protocol::{AppendError, DescriptorError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Invalid server data: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Append buffer error: {0}")]
    Append(#[from] AppendError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Interleaved layout supports at most {max} queues, got {actual}")]
    TooManyQueues { max: usize, actual: usize },

    #[error("At least one segment queue is required")]
    NoQueues,

    #[error("Session cancelled")]
    Cancelled,
}
