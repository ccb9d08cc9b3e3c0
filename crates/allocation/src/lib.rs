//! Payment allocation: distributing a payment across open invoices.
//!
//! - [`record`]: the allocation row linking a payment to an invoice.
//! - [`strategy`]: pure planning of automatic allocations.
//! - [`service`]: the orchestrator that validates, persists and audits.
//! - [`repository`]: the store ports the orchestrator runs against.

pub mod events;
pub mod outcome;
pub mod record;
pub mod report;
pub mod repository;
pub mod service;
pub mod strategy;

pub use events::AllocationEvent;
pub use outcome::{
    AllocationLineResult, AllocationOutcome, BatchReversalOutcome, PaymentPosition,
    ReversalLineResult, ReversalOutcome,
};
pub use record::{Allocation, AllocationMethod, AllocationParts, AllocationReversal};
pub use report::{
    AllocationReport, AllocationSummary, AllocationSummaryLine, CustomerBalance, InvoiceImpact,
    PaymentImpact, ReportBucket, ReversalImpact,
};
pub use repository::{AllocationDetail, AllocationRepository, UnitOfWork};
pub use service::{AllocationService, ManualLine, StrategyOptions};
pub use strategy::{AllocationStrategy, PlannedAllocation, StrategyInfo};
