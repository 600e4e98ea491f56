use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("task queue rejected request ({status}): {message}")]
    Queue { status: u16, message: String },

    #[error("malformed feed for playlist {playlist_id}: {message}")]
    MalformedFeed {
        playlist_id: String,
        message: String,
    },

    #[error("malformed payload from metadata source: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    FanOut(#[from] FanOutError),
}

impl Error {
    /// Whether a retry with the same input can reasonably succeed.
    /// Network failures, 5xx responses and database errors qualify;
    /// malformed payloads and rejected requests do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Error::Db(_) => true,
            Error::Upstream { status, .. } => *status >= 500,
            Error::Queue { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// One delivery target that exhausted its retries.
#[derive(Debug)]
pub struct FanOutFailure {
    pub target: String,
    pub message: String,
}

/// Aggregate of every failed delivery target in a run. Targets that
/// succeeded are not listed; the run attempted all of them regardless.
#[derive(Debug)]
pub struct FanOutError {
    pub failures: Vec<FanOutFailure>,
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delivery target(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.target, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {}
