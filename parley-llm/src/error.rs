use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompletionError>;

#[derive(Debug, Error)]
pub enum CompletionError {
    /// `generate` was called before `connect`. A construction-order bug in
    /// the caller, never retried.
    #[error("completion client not connected")]
    NotConnected,

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for CompletionError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
