//! Store ports used by the allocation orchestrator.
//!
//! Every write goes through a [`UnitOfWork`]: rows read through it are locked
//! until the unit commits or rolls back, and saves are checked against the
//! version the row had when it was read. Adapters map their own failures into
//! [`DomainError`](payalloc_core::DomainError), with conflicting concurrent
//! writes surfacing as `ConcurrencyConflict`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use payalloc_core::{AllocationId, CompanyId, CustomerId, DomainResult, InvoiceId, PaymentId};
use payalloc_invoicing::Invoice;
use payalloc_payments::Payment;

use crate::record::Allocation;

/// An allocation joined with the number of the invoice it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDetail {
    pub allocation: Allocation,
    pub invoice_number: String,
}

/// One atomic read-modify-write session against the allocation store.
///
/// Dropping a unit of work without committing discards everything it staged.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Load and lock a payment of `company_id`, with its allocated total.
    async fn lock_payment(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>>;

    /// Load and lock an invoice by id alone.
    ///
    /// Not company-scoped so callers can tell a foreign invoice from a missing one.
    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>>;

    /// Load and lock every open invoice of a customer.
    async fn lock_open_invoices(
        &mut self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>>;

    /// Load and lock an allocation by id alone.
    async fn lock_allocation(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>>;

    /// Load and lock the non-reversed allocations of a payment.
    async fn lock_active_allocations(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<Allocation>>;

    /// Load and lock the non-reversed allocations applied to an invoice,
    /// whichever payment they came from.
    async fn lock_invoice_allocations(
        &mut self,
        company_id: CompanyId,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<Allocation>>;

    async fn insert_allocation(&mut self, allocation: &Allocation) -> DomainResult<()>;

    /// Persist the reversal marker of an allocation that was active when read.
    async fn mark_reversed(&mut self, allocation: &Allocation) -> DomainResult<()>;

    /// Persist invoice amounts and status; fails if the row moved since it was read.
    async fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()>;

    /// Persist payment status; fails if the row moved since it was read.
    async fn save_payment(&mut self, payment: &Payment) -> DomainResult<()>;

    async fn commit(self: Box<Self>) -> DomainResult<()>;

    async fn rollback(self: Box<Self>) -> DomainResult<()>;
}

/// Entry point to the allocation store.
#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn begin(&self) -> DomainResult<Box<dyn UnitOfWork>>;

    /// Read a payment without locking it.
    async fn find_payment(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>>;

    /// Read an invoice by id alone, without locking it.
    async fn find_invoice(&self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>>;

    /// Read an allocation by id alone, without locking it.
    async fn find_allocation(
        &self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>>;

    /// Non-reversed allocations of a payment with their invoice numbers.
    async fn active_allocation_details(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<AllocationDetail>>;

    /// Open invoices of a customer, unlocked.
    async fn open_invoices(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>>;

    /// Every payment of a customer, with allocated totals.
    async fn customer_payments(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Payment>>;

    /// Allocations (reversed ones included) dated within `[from, to]`.
    async fn allocations_between(
        &self,
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<Allocation>>;
}

#[async_trait]
impl<R> AllocationRepository for Arc<R>
where
    R: AllocationRepository + ?Sized,
{
    async fn begin(&self) -> DomainResult<Box<dyn UnitOfWork>> {
        (**self).begin().await
    }

    async fn find_payment(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>> {
        (**self).find_payment(company_id, payment_id).await
    }

    async fn find_invoice(&self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>> {
        (**self).find_invoice(invoice_id).await
    }

    async fn find_allocation(
        &self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>> {
        (**self).find_allocation(allocation_id).await
    }

    async fn active_allocation_details(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<AllocationDetail>> {
        (**self).active_allocation_details(company_id, payment_id).await
    }

    async fn open_invoices(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>> {
        (**self).open_invoices(company_id, customer_id).await
    }

    async fn customer_payments(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Payment>> {
        (**self).customer_payments(company_id, customer_id).await
    }

    async fn allocations_between(
        &self,
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<Allocation>> {
        (**self).allocations_between(company_id, from, to).await
    }
}
