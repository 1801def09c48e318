use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Bad status code {code} from {path}: {body}")]
    Status { code: u16, path: String, body: String },

    #[error("{path:?} does not exist")]
    NotFound { path: String },

    #[error("No leader currently holds {key:?}")]
    NoLeader { key: String },

    #[error("Cannot acquire leader lock before establishing session")]
    NoSession,

    #[error("Session {id} has expired")]
    SessionExpired { id: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Whether a maintenance loop should back off and try again.
    ///
    /// Only local validation failures are permanent; everything the remote
    /// service says (or fails to say) may change on the next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Validation(_))
    }

    /// Status code of the failed request, if the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { code, .. } => Some(*code),
            Error::NotFound { .. } => Some(404),
            Error::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
