//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// No administrative password is configured.
    #[error("POSTGRES_PASSWORD is not set")]
    MissingPassword,

    /// A setup step kept failing past its retry budget.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: sqlx::Error,
    },
}
