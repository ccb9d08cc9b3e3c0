//! In-memory allocation store for tests/dev.
//!
//! Units of work are serialized by an owned async mutex guard: only one is
//! open at a time, and it stages its writes on a copy of the state that is
//! swapped in on commit. Version checks mirror the Postgres adapter so stale
//! writes fail the same way.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use payalloc_allocation::{Allocation, AllocationDetail, AllocationRepository, UnitOfWork};
use payalloc_core::{
    AllocationId, CompanyId, CustomerId, DomainError, DomainResult, Entity, ExpectedVersion,
    InvoiceId, PaymentId, Versioned,
};
use payalloc_invoicing::Invoice;
use payalloc_payments::Payment;

#[derive(Debug, Clone, Default)]
struct State {
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    allocations: BTreeMap<AllocationId, Allocation>,
}

impl State {
    fn total_allocated(&self, payment_id: PaymentId) -> Decimal {
        self.allocations
            .values()
            .filter(|a| a.payment_id() == payment_id && a.is_active())
            .map(|a| a.allocated_amount())
            .sum()
    }

    /// The stored payment with its allocated total derived from allocations.
    fn payment_view(&self, payment: &Payment) -> DomainResult<Payment> {
        let mut parts = payment.to_parts();
        parts.total_allocated = self.total_allocated(payment.id_typed());
        Payment::from_parts(parts)
    }

    fn open_invoices(&self, company_id: CompanyId, customer_id: CustomerId) -> Vec<Invoice> {
        let mut open: Vec<Invoice> = self
            .invoices
            .values()
            .filter(|inv| {
                inv.company_id() == company_id && inv.customer_id() == customer_id && inv.is_open()
            })
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id_typed().cmp(&b.id_typed()))
        });
        open
    }
}

/// In-memory [`AllocationRepository`].
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAllocationStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace an invoice.
    pub async fn insert_invoice(&self, invoice: Invoice) {
        let mut state = self.state.lock().await;
        state.invoices.insert(invoice.id_typed(), invoice);
    }

    /// Seed or replace a payment. Its allocated total is always derived from
    /// the stored allocations, whatever the seeded value says.
    pub async fn insert_payment(&self, payment: Payment) {
        let mut state = self.state.lock().await;
        state.payments.insert(payment.id_typed(), payment);
    }

    pub async fn invoice(&self, invoice_id: InvoiceId) -> Option<Invoice> {
        self.state.lock().await.invoices.get(&invoice_id).cloned()
    }

    pub async fn payment(&self, payment_id: PaymentId) -> DomainResult<Option<Payment>> {
        let state = self.state.lock().await;
        state
            .payments
            .get(&payment_id)
            .map(|p| state.payment_view(p))
            .transpose()
    }

    /// Every allocation row, reversed ones included, in id order.
    pub async fn allocations(&self) -> Vec<Allocation> {
        self.state.lock().await.allocations.values().cloned().collect()
    }
}

#[async_trait]
impl AllocationRepository for InMemoryAllocationStore {
    async fn begin(&self) -> DomainResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(MemoryUnitOfWork { guard, staged }))
    }

    async fn find_payment(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>> {
        let state = self.state.lock().await;
        state
            .payments
            .get(&payment_id)
            .filter(|p| p.company_id() == company_id)
            .map(|p| state.payment_view(p))
            .transpose()
    }

    async fn find_invoice(&self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>> {
        Ok(self.state.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn find_allocation(
        &self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>> {
        Ok(self.state.lock().await.allocations.get(&allocation_id).cloned())
    }

    async fn active_allocation_details(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<AllocationDetail>> {
        let state = self.state.lock().await;
        state
            .allocations
            .values()
            .filter(|a| {
                a.company_id() == company_id && a.payment_id() == payment_id && a.is_active()
            })
            .map(|a| {
                let invoice = state.invoices.get(&a.invoice_id()).ok_or_else(|| {
                    DomainError::storage(format!(
                        "allocation {} references missing invoice {}",
                        a.id_typed(),
                        a.invoice_id()
                    ))
                })?;
                Ok(AllocationDetail {
                    allocation: a.clone(),
                    invoice_number: invoice.invoice_number().to_string(),
                })
            })
            .collect()
    }

    async fn open_invoices(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>> {
        Ok(self.state.lock().await.open_invoices(company_id, customer_id))
    }

    async fn customer_payments(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Payment>> {
        let state = self.state.lock().await;
        state
            .payments
            .values()
            .filter(|p| p.company_id() == company_id && p.customer_id() == customer_id)
            .map(|p| state.payment_view(p))
            .collect()
    }

    async fn allocations_between(
        &self,
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<Allocation>> {
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .values()
            .filter(|a| {
                a.company_id() == company_id
                    && a.allocation_date() >= from
                    && a.allocation_date() <= to
            })
            .cloned()
            .collect())
    }
}

/// Unit of work over [`InMemoryAllocationStore`]. Holds the store lock until
/// committed or dropped.
pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_payment(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>> {
        self.staged
            .payments
            .get(&payment_id)
            .filter(|p| p.company_id() == company_id)
            .map(|p| self.staged.payment_view(p))
            .transpose()
    }

    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>> {
        Ok(self.staged.invoices.get(&invoice_id).cloned())
    }

    async fn lock_open_invoices(
        &mut self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>> {
        Ok(self.staged.open_invoices(company_id, customer_id))
    }

    async fn lock_allocation(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>> {
        Ok(self.staged.allocations.get(&allocation_id).cloned())
    }

    async fn lock_active_allocations(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<Allocation>> {
        Ok(self
            .staged
            .allocations
            .values()
            .filter(|a| {
                a.company_id() == company_id && a.payment_id() == payment_id && a.is_active()
            })
            .cloned()
            .collect())
    }

    async fn lock_invoice_allocations(
        &mut self,
        company_id: CompanyId,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<Allocation>> {
        Ok(self
            .staged
            .allocations
            .values()
            .filter(|a| {
                a.company_id() == company_id && a.invoice_id() == invoice_id && a.is_active()
            })
            .cloned()
            .collect())
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> DomainResult<()> {
        if self.staged.allocations.contains_key(&allocation.id_typed()) {
            return Err(DomainError::conflict(format!(
                "allocation {} already exists",
                allocation.id_typed()
            )));
        }
        self.staged
            .allocations
            .insert(allocation.id_typed(), allocation.clone());
        Ok(())
    }

    async fn mark_reversed(&mut self, allocation: &Allocation) -> DomainResult<()> {
        let stored = self
            .staged
            .allocations
            .get_mut(&allocation.id_typed())
            .ok_or_else(|| DomainError::not_found(format!("allocation {}", allocation.id_typed())))?;

        if !stored.is_active() {
            return Err(DomainError::conflict(format!(
                "allocation {} was reversed concurrently",
                allocation.id_typed()
            )));
        }
        *stored = allocation.clone();
        Ok(())
    }

    async fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        let stored = self
            .staged
            .invoices
            .get_mut(&invoice.id_typed())
            .ok_or_else(|| DomainError::not_found(format!("invoice {}", invoice.id_typed())))?;
        ExpectedVersion::of(invoice).check(stored.version())?;

        let mut parts = invoice.to_parts();
        parts.version += 1;
        *stored = Invoice::from_parts(parts)?;
        Ok(())
    }

    async fn save_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        let stored = self
            .staged
            .payments
            .get_mut(&payment.id_typed())
            .ok_or_else(|| DomainError::not_found(format!("payment {}", payment.id_typed())))?;
        ExpectedVersion::of(payment).check(stored.version())?;

        let mut parts = payment.to_parts();
        parts.version += 1;
        *stored = Payment::from_parts(parts)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DomainResult<()> {
        let MemoryUnitOfWork { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DomainResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use payalloc_invoicing::{InvoiceParts, InvoiceStatus};
    use rust_decimal_macros::dec;

    fn invoice(company_id: CompanyId) -> Invoice {
        Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id,
            customer_id: CustomerId::new(),
            invoice_number: "INV-9".to_string(),
            total_amount: dec!(100),
            paid_amount: dec!(0),
            status: InvoiceStatus::Pending,
            due_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            created_at: Utc::now(),
            version: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn stale_invoice_save_is_a_conflict() {
        let store = InMemoryAllocationStore::new();
        let seeded = invoice(CompanyId::new());
        store.insert_invoice(seeded.clone()).await;

        let mut uow = store.begin().await.unwrap();
        let mut loaded = uow.lock_invoice(seeded.id_typed()).await.unwrap().unwrap();
        loaded.apply_amount(dec!(10)).unwrap();
        uow.save_invoice(&loaded).await.unwrap();

        // Same snapshot again: the row has moved on to version 2.
        let err = uow.save_invoice(&loaded).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = InMemoryAllocationStore::new();
        let seeded = invoice(CompanyId::new());
        store.insert_invoice(seeded.clone()).await;

        let mut uow = store.begin().await.unwrap();
        let mut loaded = uow.lock_invoice(seeded.id_typed()).await.unwrap().unwrap();
        loaded.apply_amount(dec!(40)).unwrap();
        uow.save_invoice(&loaded).await.unwrap();
        uow.rollback().await.unwrap();

        let after = store.invoice(seeded.id_typed()).await.unwrap();
        assert_eq!(after, seeded);
    }

    #[tokio::test]
    async fn commit_publishes_staged_writes_with_bumped_version() {
        let store = InMemoryAllocationStore::new();
        let seeded = invoice(CompanyId::new());
        store.insert_invoice(seeded.clone()).await;

        let mut uow = store.begin().await.unwrap();
        let mut loaded = uow.lock_invoice(seeded.id_typed()).await.unwrap().unwrap();
        loaded.apply_amount(dec!(40)).unwrap();
        uow.save_invoice(&loaded).await.unwrap();
        uow.commit().await.unwrap();

        let after = store.invoice(seeded.id_typed()).await.unwrap();
        assert_eq!(after.balance_due(), dec!(60));
        assert_eq!(after.version(), 2);
    }
}
