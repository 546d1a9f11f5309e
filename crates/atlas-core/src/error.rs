use thiserror::Error;

/// The five error kinds spanning the Atlas core.
///
/// Every public operation in the workspace fails with one of these. The
/// gateway maps kinds to HTTP statuses; the scheduler logs `Storage` and
/// moves on to the next tick; tools convert `Upstream` into human-readable
/// failure strings before the LM ever sees them.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad cron expression, empty message, unknown skill
    /// name, role/document mismatch. No state was changed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referent is missing or soft-deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-2xx or malformed response from a remote collaborator
    /// (LM, embeddings, directions, push).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Database failure, carrying the driver error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Programmer error: an invariant the code relies on was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable code, used in REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Upstream(_) => "UPSTREAM",
            Error::Storage(_) => "STORAGE",
            Error::Internal(_) => "INTERNAL",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
