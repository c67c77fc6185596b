//! Error types for registry operations.

use thiserror::Error;

/// Errors that can occur during registry operations.
///
/// SQLite failures are split by how the caller can react: a busy or locked
/// database is worth retrying, a constraint failure is not.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The database was busy or locked by another connection.
    #[error("registry database is busy: {0}")]
    Busy(String),

    /// A unique or check constraint rejected the statement.
    #[error("registry constraint violated: {0}")]
    Constraint(String),

    /// Any other database failure.
    #[error("registry database error: {0}")]
    Database(String),

    /// Record not found.
    #[error("file record not found: id {0}")]
    ItemNotFound(i64),
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::PoolTimedOut => Self::Busy(message),
            sqlx::Error::Database(db) if is_busy(db.as_ref()) => Self::Busy(message),
            sqlx::Error::Database(db)
                if db.is_unique_violation() || db.is_check_violation() =>
            {
                Self::Constraint(message)
            }
            _ => Self::Database(message),
        }
    }
}

fn is_busy(db: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
    if matches!(db.code().as_deref(), Some("5" | "6")) {
        return true;
    }
    let message = db.message().to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

impl RegistryError {
    /// True when the same statement may succeed if issued again.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
