//! Invoicing domain module.
//!
//! Holds the invoice entity and its ledger arithmetic: applying and reversing
//! allocated amounts against the balance due, and recomputing the status from
//! paid vs total. Pure domain logic; persistence lives behind the allocation
//! store ports.

pub mod invoice;

pub use invoice::{Invoice, InvoiceParts, InvoiceStatus};
