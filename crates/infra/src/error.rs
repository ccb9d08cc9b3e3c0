//! Store-level errors and their mapping into the domain taxonomy.
//!
//! SQLx errors are mapped as follows:
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (other) | any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io | n/a | `Connection` |
//! | anything else | n/a | `Database` |
//!
//! A versioned `UPDATE` that touches zero rows is also reported as `Conflict`
//! by the adapter itself.

use thiserror::Error;

use payalloc_core::DomainError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another unit of work changed the same rows first.
    #[error("concurrency conflict in {operation}: {message}")]
    Conflict {
        operation: &'static str,
        message: String,
    },

    /// A stored row could not be turned back into a domain value.
    #[error("corrupt row in {operation}: {message}")]
    Corrupt {
        operation: &'static str,
        message: String,
    },

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error("connection error in {operation}: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn conflict(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            operation,
            message: message.into(),
        }
    }

    pub fn corrupt(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            operation,
            message: message.into(),
        }
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => DomainError::conflict(err.to_string()),
            other => DomainError::storage(other.to_string()),
        }
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => {
                    StoreError::Conflict { operation, message }
                }
                _ => StoreError::Database { operation, message },
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Connection {
                operation,
                message: err.to_string(),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Corrupt {
            operation,
            message: err.to_string(),
        },
        _ => StoreError::Database {
            operation,
            message: err.to_string(),
        },
    }
}
