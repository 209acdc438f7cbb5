//! Crate-wide error taxonomy.
//!
//! Recoverable API conditions (rate limits, bans, stale cursors) never show
//! up here: the queue client absorbs them by re-leasing accounts. Only fatal
//! configuration problems and exhausted retries surface to callers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQLite runtime '{0}' is too old, please upgrade to 3.24+")]
    SqliteTooOld(String),

    #[error("no account available for queue {0}")]
    NoAccount(String),

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("invalid cookie value: {0}")]
    InvalidCookies(String),

    #[error("invalid line format: {0}")]
    InvalidLineFormat(String),

    #[error("login failed: {0}")]
    Login(String),

    #[error("email code: {0}")]
    EmailCode(String),

    #[error("imap error: {0}")]
    Imap(String),

    #[error("feature flags rejected by remote, update required: {0}")]
    StaleFeatures(String),

    #[error("challenge token keys: {0}")]
    ChallengeKeys(String),

    #[error("unknown API error after retries: {0}")]
    UnknownApi(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<async_imap::error::Error> for Error {
    fn from(e: async_imap::error::Error) -> Self {
        Error::Imap(e.to_string())
    }
}
