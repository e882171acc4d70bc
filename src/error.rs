use crate::callrecord::CallStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network or API failure, retried by the next poll.
    #[error("call-control request failed: {0}")]
    TransientFetch(String),

    /// Rejected before any network call, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation conflicts with the current state; nothing was mutated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote call ended or failed.
    #[error("call {call} ended with status {status}")]
    TerminalCall { call: String, status: CallStatus },

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Only validation and conflict errors are meant for the user directly.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Conflict(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TransientFetch(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Validation(format!("invalid api url: {}", e))
    }
}
