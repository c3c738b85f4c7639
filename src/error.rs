use thiserror::Error;

/// Result type used across the canteen library.
pub type Result<T> = std::result::Result<T, Error>;

/// Directory error code meaning "nothing under this node".
pub const NO_DATA_CODE: i64 = 60123;

#[derive(Error, Debug)]
pub enum Error {
    /// An invariant or input rule was violated. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Retry budget exhausted on a transactional write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A singleton workflow (mapping rebuild) is already running.
    #[error("busy: {0}")]
    Busy(String),

    /// The directory or notification channel rejected a call.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("transient failure: {0}")]
    Transient(String),

    /// Store unreachable at startup.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid student token")]
    BadToken,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Whether the failure is worth another attempt.
    ///
    /// SQLite reports writer contention as BUSY (5) or LOCKED (6); extended
    /// codes such as BUSY_SNAPSHOT (517) share the low byte.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            Error::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::Upstream { code, .. } if *code == NO_DATA_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_no_data_sentinel() {
        let err = Error::Upstream { code: NO_DATA_CODE, message: "no data".into() };
        assert!(err.is_no_data());
        assert!(!err.is_transient());

        let other = Error::Upstream { code: 40014, message: "bad token".into() };
        assert!(!other.is_no_data());
    }

    #[test]
    fn only_retryable_kinds_are_transient() {
        assert!(Error::Transient("queue full".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::validation("bad window").is_transient());
        assert!(!Error::not_found("meal 3").is_transient());
        assert!(!Error::Conflict("exhausted".into()).is_transient());
    }
}
