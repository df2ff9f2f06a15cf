//! Collaborator interfaces and their Postgres adapters.
//!
//! The routing core only sees the traits; `main` wires the Postgres
//! implementations, tests wire in-memory fakes.

pub mod identity;
pub mod tokens;
pub mod users;

use thiserror::Error;

/// Errors surfaced by repository calls.
///
/// `NotFound` is the benign no-rows sentinel: circuit breakers must not
/// count it as a failure.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(String),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound,
            other => Self::Database(other.to_string()),
        }
    }
}
