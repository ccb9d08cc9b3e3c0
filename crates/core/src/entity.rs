//! Entity trait: identity + continuity across state changes.

use crate::id::CompanyId;

/// Entity marker + minimal interface.
///
/// Every entity in this workspace is owned by exactly one company; the
/// company is part of its identity for isolation checks.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Returns the owning company (tenant boundary).
    fn company_id(&self) -> CompanyId;
}
