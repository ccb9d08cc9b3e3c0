//! Domain error model.

use thiserror::Error;

use crate::id::CompanyId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Every variant aborts the enclosing unit of work; nothing is partially
/// persisted. Only [`DomainError::ConcurrencyConflict`] is worth retrying, and
/// retrying is left to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or out-of-range request (amount above balance or above the
    /// payment's remaining amount, payment not allocatable, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An invoice or allocation belongs to a different company than the one
    /// the operation runs for.
    #[error("cross-tenant access rejected: {entity} belongs to company {actual}, expected {expected}")]
    CrossTenant {
        entity: String,
        expected: CompanyId,
        actual: CompanyId,
    },

    /// The requested allocation strategy name is not one of the known ones.
    #[error("unknown allocation strategy: {0}")]
    UnknownStrategy(String),

    /// The store detected a conflicting concurrent write.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A zero/negative amount reached the ledger.
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence failed for a reason other than a conflict.
    #[error("storage error: {0}")]
    Storage(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cross_tenant(entity: impl Into<String>, expected: CompanyId, actual: CompanyId) -> Self {
        Self::CrossTenant {
            entity: entity.into(),
            expected,
            actual,
        }
    }

    pub fn unknown_strategy(name: impl Into<String>) -> Self {
        Self::UnknownStrategy(name.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn invalid_allocation(msg: impl Into<String>) -> Self {
        Self::InvalidAllocation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
