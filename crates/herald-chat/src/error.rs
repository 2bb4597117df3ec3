use herald_stream::StreamError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("A response is already streaming for conversation {0}")]
    StreamActive(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Assistant returned an error: {0}")]
    Application(String),

    #[error("Stream closed before any content arrived")]
    Closed,

    #[error("Stream transport failed: {0}")]
    Transport(#[from] StreamError),
}

impl ChatError {
    /// Text suitable for showing next to the failed turn
    pub fn user_message(&self) -> String {
        match self {
            Self::StreamActive(_) => {
                "A response is still being generated. Wait for it to finish or stop it first.".to_string()
            }
            Self::ConversationNotFound(_) => "This conversation no longer exists.".to_string(),
            Self::EmptyMessage => "Type a message before sending.".to_string(),
            Self::Application(reason) => format!("The assistant could not answer: {}", reason),
            Self::Closed => "The assistant sent an empty response. Please try again.".to_string(),
            Self::Transport(StreamError::HttpStatus { status: 401 | 403, .. }) => {
                "You are not signed in or your session has expired.".to_string()
            }
            Self::Transport(_) => "Connection lost. Check your network and try again.".to_string(),
        }
    }

    /// Whether offering a "retry" affordance makes sense
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Application(_) | Self::Closed => true,
            Self::Transport(StreamError::Exhausted { .. }) => true,
            Self::Transport(err) => err.is_retryable(),
            Self::StreamActive(_) | Self::ConversationNotFound(_) | Self::EmptyMessage => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
