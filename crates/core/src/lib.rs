//! `payalloc-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the invoicing,
//! payments and allocation crates (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AllocationId, CompanyId, CustomerId, InvoiceId, PaymentId, UserId};
pub use version::{ExpectedVersion, Versioned};
