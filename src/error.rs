use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("usage: {usage}")]
    Usage { command: String, usage: String },
    #[error("you must be logged in to run this command")]
    NotLoggedIn,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("limit must be a positive integer, got {0:?}")]
    InvalidLimit(String),
    #[error("could not locate the home directory")]
    NoHomeDir,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config format error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed parsing error: {0}")]
    Feed(#[from] rss::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn usage(command: &str, usage: &str) -> Self {
        Error::Usage {
            command: command.to_string(),
            usage: usage.to_string(),
        }
    }

    /// Maps a unique-constraint violation to `AlreadyExists`, anything else to `Database`.
    pub(crate) fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::AlreadyExists(what.into())
            }
            _ => Error::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
