/// Errors returned by an [`ActivityBackend`](crate::backend::ActivityBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed backend response: {0}")]
    Decode(String),

    #[error("Backend unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Raised when external contact data fails validation at the boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Contact id must not be empty")]
    EmptyContactId,

    #[error("Invalid timestamp for contact {contact_id}: {millis}")]
    InvalidTimestamp { contact_id: String, millis: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Calculation worker is not running")]
    Disconnected,

    #[error("Calculation panicked: {0}")]
    Panicked(String),
}
