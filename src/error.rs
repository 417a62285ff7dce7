use thiserror::Error;

/// Errors surfaced by the injector to its caller.
///
/// Unique-constraint races inside the intern and bodypart phases are handled
/// internally with savepoints and never appear here; anything that does
/// arrive means the enclosing transaction has been rolled back.
#[derive(Debug, Error)]
pub enum InjectError {
    /// The message failed validation before any database work was attempted.
    #[error("invalid message: {0}")]
    InvalidInput(String),

    /// No database handle could be acquired from the pool.
    #[error("no database handles available")]
    NoHandles,

    /// Any other database failure. The transaction is already rolled back.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// An invariant the earlier phases guarantee did not hold; indicates a
    /// bug rather than bad input or a database problem.
    #[error("internal error: {0}")]
    Internal(String),
}

impl InjectError {
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => InjectError::NoHandles,
            other => InjectError::Db(other),
        }
    }
}

/// True if `err` is a unique-constraint violation naming `constraint`,
/// i.e. a benign insertion race with a concurrent injector.
pub(crate) fn is_unique_race(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(constraint),
        _ => false,
    }
}
