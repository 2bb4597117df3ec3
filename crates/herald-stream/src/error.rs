use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("No data received within {0:?}")]
    Timeout(Duration),

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Gave up after {attempts} failed attempts: {last}")]
    Exhausted { attempts: u32, last: Box<StreamError> },
}

impl StreamError {
    /// Whether the reconnection policy may try again after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Cancelled | Self::InvalidRequest(_) | Self::Exhausted { .. } => false,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
