use thiserror::Error;

/// Error taxonomy shared by every subsystem. The HTTP layer maps each
/// variant onto a status code; batch loops use [`AppError::is_transient`]
/// to decide whether the next tick should retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Integrity(String),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps a storage failure with a `"Failed to <context>: <error>"` message
    /// and classifies it by the underlying sqlx error.
    pub fn storage(context: impl AsRef<str>, err: sqlx::Error) -> Self {
        let message = format!("Failed to {}: {}", context.as_ref(), err);
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(message),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Transient(message)
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(message)
            }
            sqlx::Error::Database(db_err) if is_busy_code(db_err.code().as_deref()) => {
                Self::Transient(message)
            }
            _ => Self::Internal(message),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    match code.and_then(|c| c.parse::<i64>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => false,
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Failed to encode JSON column: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = AppError::storage("fetch task", sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(err.to_string().starts_with("Failed to fetch task:"));
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = AppError::storage("acquire connection", sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn busy_codes_include_extended_variants() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("261")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("2067")));
        assert!(!is_busy_code(None));
    }
}
