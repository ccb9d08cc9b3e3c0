//! Optimistic concurrency primitives for persisted entities.

use crate::error::{DomainError, DomainResult};

/// An entity whose persisted row carries a monotonically increasing version.
///
/// The version is read together with the row and checked again on write; a
/// mismatch means another unit of work committed in between.
pub trait Versioned {
    /// Version of the row as it was loaded.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a persisted row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (inserts, migrations).
    Any,
    /// Require the row to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn of<T: Versioned>(entity: &T) -> Self {
        ExpectedVersion::Exact(entity.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
