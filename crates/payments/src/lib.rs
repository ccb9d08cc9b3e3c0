//! Payments domain module.
//!
//! A payment is money received from a customer. This crate tracks how much of
//! it has been allocated to invoices and what is still available; the
//! allocation rows themselves live in `payalloc-allocation`.

pub mod payment;

pub use payment::{AllocationStatus, Payment, PaymentParts, PaymentStatus};
