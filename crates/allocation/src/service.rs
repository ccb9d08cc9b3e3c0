//! Payment allocation orchestrator.
//!
//! Every write follows the same shape: open one unit of work, lock the
//! payment, validate, mutate invoices/payment/allocations in memory, persist,
//! commit, and only then publish audit events. Any error rolls the whole unit
//! back; nothing is retried here.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{Span, field, instrument};

use payalloc_core::money;
use payalloc_core::{
    AllocationId, CompanyId, CustomerId, DomainError, DomainResult, Entity, InvoiceId, PaymentId,
    UserId,
};
use payalloc_events::{Event, EventBus, EventEnvelope};
use payalloc_invoicing::{Invoice, InvoiceStatus};
use payalloc_payments::Payment;

use crate::events::{
    AllocationApplied, AllocationEvent, AllocationReversed, AllocationSkipped,
    PaymentFullyAllocated,
};
use crate::outcome::{
    AllocationLineResult, AllocationOutcome, BatchReversalOutcome, PaymentPosition,
    ReversalLineResult, ReversalOutcome,
};
use crate::record::{Allocation, AllocationMethod, AllocationParts};
use crate::report::{AllocationReport, AllocationSummary, CustomerBalance, ReversalImpact};
use crate::repository::{AllocationRepository, UnitOfWork};
use crate::strategy::{AllocationStrategy, StrategyInfo};

/// One caller-specified amount for one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualLine {
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub notes: Option<String>,
}

impl ManualLine {
    pub fn new(invoice_id: InvoiceId, amount: Decimal) -> Self {
        Self {
            invoice_id,
            amount,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Knobs for a strategy-driven allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyOptions {
    /// Cut-off for "overdue"; defaults to the time of the call.
    pub as_of: Option<DateTime<Utc>>,
    /// Distribute at most this much of the payment's remaining amount.
    pub max_amount: Option<Decimal>,
}

/// A line about to be applied, whichever way it was chosen.
struct BatchLine {
    invoice_id: InvoiceId,
    amount: Decimal,
    notes: Option<String>,
}

/// Payment allocation service.
pub struct AllocationService<R, B> {
    repository: R,
    bus: B,
    default_strategy: AllocationStrategy,
}

impl<R, B> AllocationService<R, B>
where
    R: AllocationRepository,
    B: EventBus<EventEnvelope<AllocationEvent>>,
{
    pub fn new(repository: R, bus: B) -> Self {
        Self {
            repository,
            bus,
            default_strategy: AllocationStrategy::Fifo,
        }
    }

    pub fn with_default_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn default_strategy(&self) -> AllocationStrategy {
        self.default_strategy
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Strategies callers may pass to [`Self::allocate_by_strategy`].
    pub fn available_strategies(&self) -> Vec<StrategyInfo> {
        AllocationStrategy::catalogue()
    }

    /// Apply explicit amounts to invoices, in input order, all or nothing.
    #[instrument(
        skip(self, lines),
        fields(
            company_id = %company_id,
            payment_id = %payment_id,
            line_count = lines.len(),
            allocated = field::Empty
        ),
        err
    )]
    pub async fn allocate_manual(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
        lines: Vec<ManualLine>,
        actor: UserId,
    ) -> DomainResult<AllocationOutcome> {
        if lines.is_empty() {
            return Err(DomainError::validation("no allocation lines given"));
        }
        if let Some(line) = lines.iter().find(|line| line.amount <= Decimal::ZERO) {
            return Err(DomainError::invalid_allocation(format!(
                "amount {} for invoice {} must be positive",
                line.amount, line.invoice_id
            )));
        }
        if let Some(line) = lines.iter().find(|line| !money::is_whole_cents(line.amount)) {
            return Err(DomainError::validation(format!(
                "amount {} for invoice {} has more than {} decimal places",
                line.amount,
                line.invoice_id,
                money::MONEY_SCALE
            )));
        }

        let batch = lines
            .into_iter()
            .map(|line| BatchLine {
                invoice_id: line.invoice_id,
                amount: line.amount,
                notes: line.notes,
            })
            .collect();

        let mut uow = self.repository.begin().await?;
        let result = manual_in(&mut *uow, company_id, payment_id, batch, actor, Utc::now()).await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        Span::current().record("allocated", field::display(outcome.batch_total()));
        tracing::info!(
            lines = outcome.lines.len(),
            remaining = %outcome.remaining_amount,
            "manual allocation committed"
        );
        Ok(outcome)
    }

    /// Plan with a named strategy over the customer's open invoices and apply it.
    ///
    /// Finding nothing to allocate is not an error: the outcome is empty and an
    /// `allocation.skipped` event records why.
    #[instrument(
        skip(self, options),
        fields(
            company_id = %company_id,
            payment_id = %payment_id,
            strategy = %strategy_name,
            allocated = field::Empty
        ),
        err
    )]
    pub async fn allocate_by_strategy(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
        strategy_name: &str,
        actor: UserId,
        options: StrategyOptions,
    ) -> DomainResult<AllocationOutcome> {
        let strategy: AllocationStrategy = strategy_name.parse()?;
        if let Some(max) = options.max_amount {
            if max <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "max_amount must be positive, got {max}"
                )));
            }
        }

        let now = Utc::now();
        let as_of = options.as_of.unwrap_or(now);

        let mut uow = self.repository.begin().await?;
        let result = strategy_in(
            &mut *uow,
            company_id,
            payment_id,
            strategy,
            options.max_amount,
            actor,
            as_of,
            now,
        )
        .await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        Span::current().record("allocated", field::display(outcome.batch_total()));
        tracing::info!(
            lines = outcome.lines.len(),
            remaining = %outcome.remaining_amount,
            "automatic allocation committed"
        );
        Ok(outcome)
    }

    /// [`Self::allocate_by_strategy`] with the configured default strategy.
    pub async fn allocate_with_default_strategy(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
        actor: UserId,
        options: StrategyOptions,
    ) -> DomainResult<AllocationOutcome> {
        let name = self.default_strategy.as_str();
        self.allocate_by_strategy(company_id, payment_id, name, actor, options)
            .await
    }

    /// Undo one allocation and reinstate the invoice balance.
    #[instrument(
        skip(self, reason),
        fields(company_id = %company_id, allocation_id = %allocation_id),
        err
    )]
    pub async fn reverse_allocation(
        &self,
        company_id: CompanyId,
        allocation_id: AllocationId,
        reason: &str,
        actor: UserId,
    ) -> DomainResult<ReversalOutcome> {
        let reason = reversal_reason(reason)?;

        let mut uow = self.repository.begin().await?;
        let result =
            reverse_one_in(&mut *uow, company_id, allocation_id, reason, actor, Utc::now()).await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        tracing::info!(amount = %outcome.total_reversed, "allocation reversed");
        Ok(outcome)
    }

    /// Undo every active allocation of a payment in one unit of work.
    #[instrument(
        skip(self, reason),
        fields(company_id = %company_id, payment_id = %payment_id),
        err
    )]
    pub async fn reverse_payment_allocations(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
        reason: &str,
        actor: UserId,
    ) -> DomainResult<ReversalOutcome> {
        let reason = reversal_reason(reason)?;

        let mut uow = self.repository.begin().await?;
        let result =
            reverse_all_in(&mut *uow, company_id, payment_id, reason, actor, Utc::now()).await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        tracing::info!(
            reversed = outcome.lines.len(),
            amount = %outcome.total_reversed,
            "payment allocations reversed"
        );
        Ok(outcome)
    }

    /// Undo the given allocations in the order given, all or nothing. They may
    /// belong to different payments.
    #[instrument(
        skip(self, allocation_ids, reason),
        fields(company_id = %company_id, requested = allocation_ids.len()),
        err
    )]
    pub async fn reverse_allocations(
        &self,
        company_id: CompanyId,
        allocation_ids: &[AllocationId],
        reason: &str,
        actor: UserId,
    ) -> DomainResult<BatchReversalOutcome> {
        let reason = reversal_reason(reason)?;
        let allocation_ids = distinct_ids(allocation_ids)?;

        let mut uow = self.repository.begin().await?;
        let result =
            reverse_many_in(&mut *uow, company_id, allocation_ids, reason, actor, Utc::now()).await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        tracing::info!(
            reversed = outcome.lines.len(),
            payments = outcome.payments.len(),
            amount = %outcome.total_reversed,
            "allocations reversed"
        );
        Ok(outcome)
    }

    /// Undo the active allocations of an invoice, newest first.
    ///
    /// With `max_amount`, reversal stops before the running total would pass
    /// it. Allocations are never split.
    #[instrument(
        skip(self, reason),
        fields(company_id = %company_id, invoice_id = %invoice_id, max_amount = ?max_amount),
        err
    )]
    pub async fn reverse_invoice_allocations(
        &self,
        company_id: CompanyId,
        invoice_id: InvoiceId,
        reason: &str,
        actor: UserId,
        max_amount: Option<Decimal>,
    ) -> DomainResult<BatchReversalOutcome> {
        let reason = reversal_reason(reason)?;
        if let Some(max) = max_amount {
            if max <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "max_amount must be positive, got {max}"
                )));
            }
        }

        let mut uow = self.repository.begin().await?;
        let result = reverse_invoice_in(
            &mut *uow,
            company_id,
            invoice_id,
            max_amount,
            reason,
            actor,
            Utc::now(),
        )
        .await;
        let outcome = self.finish(uow, company_id, actor, result).await?;

        tracing::info!(
            reversed = outcome.lines.len(),
            amount = %outcome.total_reversed,
            "invoice allocations reversed"
        );
        Ok(outcome)
    }

    /// What reversing the given allocations would do to their invoices and
    /// payments. Read-only; nothing is locked.
    #[instrument(
        skip(self, allocation_ids),
        fields(company_id = %company_id, requested = allocation_ids.len()),
        err
    )]
    pub async fn reversal_impact(
        &self,
        company_id: CompanyId,
        allocation_ids: &[AllocationId],
    ) -> DomainResult<ReversalImpact> {
        let allocation_ids = distinct_ids(allocation_ids)?;

        let mut allocations = Vec::with_capacity(allocation_ids.len());
        for allocation_id in allocation_ids {
            let allocation = self
                .repository
                .find_allocation(allocation_id)
                .await?
                .ok_or_else(|| DomainError::not_found(format!("allocation {allocation_id}")))?;
            ensure_tenant(&allocation, company_id)?;
            allocations.push(allocation);
        }

        let mut invoices: BTreeMap<InvoiceId, Invoice> = BTreeMap::new();
        let mut payments: BTreeMap<PaymentId, Payment> = BTreeMap::new();
        for allocation in allocations.iter().filter(|a| a.is_active()) {
            if let Entry::Vacant(entry) = invoices.entry(allocation.invoice_id()) {
                let invoice = self
                    .repository
                    .find_invoice(allocation.invoice_id())
                    .await?
                    .ok_or_else(|| {
                        DomainError::not_found(format!("invoice {}", allocation.invoice_id()))
                    })?;
                entry.insert(invoice);
            }
            if let Entry::Vacant(entry) = payments.entry(allocation.payment_id()) {
                let payment = self
                    .repository
                    .find_payment(company_id, allocation.payment_id())
                    .await?
                    .ok_or_else(|| {
                        DomainError::not_found(format!("payment {}", allocation.payment_id()))
                    })?;
                entry.insert(payment);
            }
        }

        ReversalImpact::project(&allocations, &invoices, &payments)
    }

    /// Where a payment's money went. Read-only.
    #[instrument(skip(self), fields(company_id = %company_id, payment_id = %payment_id), err)]
    pub async fn get_allocation_summary(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<AllocationSummary> {
        let payment = self
            .repository
            .find_payment(company_id, payment_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("payment {payment_id}")))?;
        let details = self
            .repository
            .active_allocation_details(company_id, payment_id)
            .await?;

        Ok(AllocationSummary::build(&payment, details))
    }

    #[instrument(skip(self), fields(company_id = %company_id, customer_id = %customer_id), err)]
    pub async fn customer_balance(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<CustomerBalance> {
        let invoices = self.repository.open_invoices(company_id, customer_id).await?;
        let payments = self
            .repository
            .customer_payments(company_id, customer_id)
            .await?;

        Ok(CustomerBalance::compute(
            company_id,
            customer_id,
            &invoices,
            &payments,
        ))
    }

    #[instrument(skip(self), fields(company_id = %company_id), err)]
    pub async fn allocation_report(
        &self,
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<AllocationReport> {
        if from > to {
            return Err(DomainError::validation(format!(
                "report period starts ({from}) after it ends ({to})"
            )));
        }

        let allocations = self
            .repository
            .allocations_between(company_id, from, to)
            .await?;
        Ok(AllocationReport::build(company_id, from, to, &allocations))
    }

    /// Commit and publish on success; roll back on failure.
    async fn finish<T>(
        &self,
        uow: Box<dyn UnitOfWork>,
        company_id: CompanyId,
        actor: UserId,
        result: DomainResult<(T, Vec<AllocationEvent>)>,
    ) -> DomainResult<T> {
        match result {
            Ok((value, events)) => {
                uow.commit().await?;
                self.publish(company_id, actor, events);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn publish(&self, company_id: CompanyId, actor: UserId, events: Vec<AllocationEvent>) {
        for (idx, event) in events.into_iter().enumerate() {
            let (subject_id, subject_type) = match &event {
                AllocationEvent::AllocationApplied(e) => (*e.allocation_id.as_uuid(), "allocation"),
                AllocationEvent::AllocationReversed(e) => {
                    (*e.allocation_id.as_uuid(), "allocation")
                }
                AllocationEvent::PaymentFullyAllocated(e) => (*e.payment_id.as_uuid(), "payment"),
                AllocationEvent::AllocationSkipped(e) => (*e.payment_id.as_uuid(), "payment"),
            };
            let event_type = event.event_type();
            let envelope = EventEnvelope::new(
                company_id,
                subject_id,
                subject_type,
                Some(actor),
                idx as u64 + 1,
                event,
            );

            // The change is already committed; a lost audit message is logged, not raised.
            if let Err(err) = self.bus.publish(envelope) {
                tracing::warn!(error = %err, event_type, "failed to publish allocation event");
            }
        }
    }
}

async fn manual_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    payment_id: PaymentId,
    lines: Vec<BatchLine>,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(AllocationOutcome, Vec<AllocationEvent>)> {
    let mut payment = load_payment(uow, company_id, payment_id).await?;
    payment.ensure_allocatable()?;

    let requested: Decimal = lines.iter().map(|line| line.amount).sum();
    if requested > payment.remaining_amount() {
        return Err(DomainError::validation(format!(
            "requested {requested} exceeds remaining {} on payment {}",
            payment.remaining_amount(),
            payment.payment_number()
        )));
    }

    apply_lines(
        uow,
        company_id,
        &mut payment,
        BTreeMap::new(),
        lines,
        AllocationMethod::Manual,
        None,
        actor,
        now,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn strategy_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    payment_id: PaymentId,
    strategy: AllocationStrategy,
    max_amount: Option<Decimal>,
    actor: UserId,
    as_of: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DomainResult<(AllocationOutcome, Vec<AllocationEvent>)> {
    let mut payment = load_payment(uow, company_id, payment_id).await?;
    payment.ensure_allocatable()?;

    let available = match max_amount {
        Some(max) => payment.remaining_amount().min(max),
        None => payment.remaining_amount(),
    };

    let candidates = if money::is_negligible(available) {
        Vec::new()
    } else {
        uow.lock_open_invoices(company_id, payment.customer_id())
            .await?
    };

    let plan = strategy.plan(available, &candidates, as_of);
    if plan.is_empty() {
        let reason = if money::is_negligible(available) {
            "payment has nothing left to allocate"
        } else if candidates.is_empty() {
            "customer has no open invoices"
        } else {
            "no invoice qualified for an allocation"
        };
        tracing::info!(%reason, %available, "automatic allocation skipped");

        let skipped = AllocationEvent::AllocationSkipped(AllocationSkipped {
            payment_id,
            strategy,
            reason: reason.to_string(),
            occurred_at: now,
        });
        return Ok((outcome_for(&payment, Vec::new()), vec![skipped]));
    }

    let preloaded = candidates
        .into_iter()
        .map(|invoice| (invoice.id_typed(), invoice))
        .collect();
    let lines = plan
        .into_iter()
        .map(|planned| BatchLine {
            invoice_id: planned.invoice_id,
            amount: planned.amount,
            notes: Some(planned.notes),
        })
        .collect();

    apply_lines(
        uow,
        company_id,
        &mut payment,
        preloaded,
        lines,
        AllocationMethod::Automatic,
        Some(strategy),
        actor,
        now,
    )
    .await
}

/// Shared by manual and automatic allocation: validates each line against the
/// invoice as left by earlier lines, then persists everything touched.
#[allow(clippy::too_many_arguments)]
async fn apply_lines(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    payment: &mut Payment,
    mut invoices: BTreeMap<InvoiceId, Invoice>,
    lines: Vec<BatchLine>,
    method: AllocationMethod,
    strategy: Option<AllocationStrategy>,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(AllocationOutcome, Vec<AllocationEvent>)> {
    let mut changed = BTreeSet::new();
    let mut results = Vec::with_capacity(lines.len());
    let mut events = Vec::with_capacity(lines.len() + 1);

    for line in lines {
        let invoice = match invoices.entry(line.invoice_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(load_invoice(uow, company_id, line.invoice_id).await?),
        };

        if invoice.status().is_closed() {
            return Err(DomainError::validation(format!(
                "invoice {} is {} and cannot receive allocations",
                invoice.invoice_number(),
                invoice.status()
            )));
        }
        if line.amount > invoice.balance_due() {
            return Err(DomainError::validation(format!(
                "amount {} exceeds balance due {} on invoice {}",
                line.amount,
                invoice.balance_due(),
                invoice.invoice_number()
            )));
        }

        let previous_balance = invoice.balance_due();
        invoice.apply_amount(line.amount)?;
        payment.record_allocation(line.amount)?;

        let allocation = Allocation::from_parts(AllocationParts {
            id: AllocationId::new(),
            company_id,
            payment_id: payment.id_typed(),
            invoice_id: line.invoice_id,
            allocated_amount: line.amount,
            allocation_date: now,
            method,
            strategy,
            notes: line.notes,
            created_by: actor,
            reversal: None,
        })?;
        uow.insert_allocation(&allocation).await?;
        changed.insert(line.invoice_id);

        tracing::debug!(
            allocation_id = %allocation.id_typed(),
            invoice_id = %line.invoice_id,
            amount = %line.amount,
            "allocation staged"
        );

        results.push(AllocationLineResult {
            allocation_id: allocation.id_typed(),
            invoice_id: line.invoice_id,
            invoice_number: invoice.invoice_number().to_string(),
            allocated_amount: line.amount,
            previous_balance,
            new_balance: invoice.balance_due(),
            invoice_status: invoice.status(),
        });
        events.push(AllocationEvent::AllocationApplied(AllocationApplied {
            allocation_id: allocation.id_typed(),
            payment_id: payment.id_typed(),
            invoice_id: line.invoice_id,
            invoice_number: invoice.invoice_number().to_string(),
            amount: line.amount,
            previous_balance,
            new_balance: invoice.balance_due(),
            invoice_status: invoice.status(),
            method,
            strategy,
            occurred_at: now,
        }));
    }

    for invoice_id in &changed {
        if let Some(invoice) = invoices.get(invoice_id) {
            uow.save_invoice(invoice).await?;
        }
    }

    if payment.is_fully_allocated() {
        payment.mark_completed();
        events.push(AllocationEvent::PaymentFullyAllocated(PaymentFullyAllocated {
            payment_id: payment.id_typed(),
            net_amount: payment.net_amount(),
            total_allocated: payment.total_allocated(),
            occurred_at: now,
        }));
    }
    uow.save_payment(payment).await?;

    Ok((outcome_for(payment, results), events))
}

async fn reverse_one_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    allocation_id: AllocationId,
    reason: String,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(ReversalOutcome, Vec<AllocationEvent>)> {
    let allocation = lock_active_allocation(uow, company_id, allocation_id).await?;
    let payment_id = allocation.payment_id();

    let payments = lock_payments(uow, company_id, std::slice::from_ref(&allocation)).await?;
    reverse_lines(uow, company_id, payments, vec![allocation], reason, actor, now)
        .await?
        .into_single(payment_id)
}

async fn reverse_all_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    payment_id: PaymentId,
    reason: String,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(ReversalOutcome, Vec<AllocationEvent>)> {
    let payment = load_payment(uow, company_id, payment_id).await?;

    let mut allocations = uow.lock_active_allocations(company_id, payment_id).await?;
    if allocations.is_empty() {
        return Err(DomainError::validation(format!(
            "payment {} has no active allocations to reverse",
            payment.payment_number()
        )));
    }
    allocations.sort_by(|a, b| {
        a.allocation_date()
            .cmp(&b.allocation_date())
            .then_with(|| a.id_typed().cmp(&b.id_typed()))
    });

    let payments = BTreeMap::from([(payment_id, payment)]);
    reverse_lines(uow, company_id, payments, allocations, reason, actor, now)
        .await?
        .into_single(payment_id)
}

async fn reverse_many_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    allocation_ids: Vec<AllocationId>,
    reason: String,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(BatchReversalOutcome, Vec<AllocationEvent>)> {
    let mut allocations = Vec::with_capacity(allocation_ids.len());
    for allocation_id in allocation_ids {
        allocations.push(lock_active_allocation(uow, company_id, allocation_id).await?);
    }

    let payments = lock_payments(uow, company_id, &allocations).await?;
    Ok(reverse_lines(uow, company_id, payments, allocations, reason, actor, now)
        .await?
        .into_batch())
}

async fn reverse_invoice_in(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    invoice_id: InvoiceId,
    max_amount: Option<Decimal>,
    reason: String,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<(BatchReversalOutcome, Vec<AllocationEvent>)> {
    let mut allocations = uow.lock_invoice_allocations(company_id, invoice_id).await?;
    if allocations.is_empty() {
        // Tells a missing or foreign invoice apart from one with nothing applied.
        let invoice = load_invoice(uow, company_id, invoice_id).await?;
        return Err(DomainError::validation(format!(
            "invoice {} has no active allocations to reverse",
            invoice.invoice_number()
        )));
    }
    allocations.sort_by(|a, b| {
        b.allocation_date()
            .cmp(&a.allocation_date())
            .then_with(|| b.id_typed().cmp(&a.id_typed()))
    });

    if let Some(max) = max_amount {
        let mut running = Decimal::ZERO;
        allocations.retain(|allocation| {
            running += allocation.allocated_amount();
            running <= max
        });
        if allocations.is_empty() {
            return Err(DomainError::validation(format!(
                "the newest allocation on invoice {invoice_id} is larger than max_amount {max}"
            )));
        }
    }

    let payments = lock_payments(uow, company_id, &allocations).await?;
    Ok(reverse_lines(uow, company_id, payments, allocations, reason, actor, now)
        .await?
        .into_batch())
}

/// Reversed lines plus the payments they released money back to.
struct Reversed {
    lines: Vec<ReversalLineResult>,
    events: Vec<AllocationEvent>,
    payments: BTreeMap<PaymentId, Payment>,
}

impl Reversed {
    fn into_single(
        mut self,
        payment_id: PaymentId,
    ) -> DomainResult<(ReversalOutcome, Vec<AllocationEvent>)> {
        let payment = self
            .payments
            .remove(&payment_id)
            .ok_or_else(|| DomainError::not_found(format!("payment {payment_id}")))?;

        let outcome = ReversalOutcome {
            payment_id,
            total_reversed: self.lines.iter().map(|line| line.reversed_amount).sum(),
            lines: self.lines,
            total_allocated: payment.total_allocated(),
            remaining_amount: payment.remaining_amount(),
            allocation_status: payment.allocation_status(),
        };
        Ok((outcome, self.events))
    }

    fn into_batch(self) -> (BatchReversalOutcome, Vec<AllocationEvent>) {
        let payments = self
            .payments
            .values()
            .map(|payment| PaymentPosition {
                payment_id: payment.id_typed(),
                payment_number: payment.payment_number().to_string(),
                total_allocated: payment.total_allocated(),
                remaining_amount: payment.remaining_amount(),
                allocation_status: payment.allocation_status(),
            })
            .collect();

        let outcome = BatchReversalOutcome {
            total_reversed: self.lines.iter().map(|line| line.reversed_amount).sum(),
            lines: self.lines,
            payments,
        };
        (outcome, self.events)
    }
}

/// Shared by every reversal path: reinstates each invoice balance, releases
/// the amount on its payment and marks the allocation reversed. `payments`
/// must hold every payment the allocations came from, already locked.
async fn reverse_lines(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    mut payments: BTreeMap<PaymentId, Payment>,
    allocations: Vec<Allocation>,
    reason: String,
    actor: UserId,
    now: DateTime<Utc>,
) -> DomainResult<Reversed> {
    let mut invoices: BTreeMap<InvoiceId, Invoice> = BTreeMap::new();
    let mut lines = Vec::with_capacity(allocations.len());
    let mut events = Vec::with_capacity(allocations.len());

    for mut allocation in allocations {
        let payment_id = allocation.payment_id();
        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| DomainError::not_found(format!("payment {payment_id}")))?;

        let invoice_id = allocation.invoice_id();
        let invoice = match invoices.entry(invoice_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(load_invoice(uow, company_id, invoice_id).await?),
        };

        if invoice.status() == InvoiceStatus::Cancelled {
            return Err(DomainError::validation(format!(
                "invoice {} is cancelled; its allocations cannot be reversed",
                invoice.invoice_number()
            )));
        }

        let amount = allocation.allocated_amount();
        let previous_balance = invoice.balance_due();
        invoice.reverse_amount(amount)?;
        payment.release_allocation(amount)?;
        allocation.reverse(actor, reason.clone(), now)?;
        uow.mark_reversed(&allocation).await?;

        lines.push(ReversalLineResult {
            allocation_id: allocation.id_typed(),
            payment_id,
            invoice_id,
            invoice_number: invoice.invoice_number().to_string(),
            reversed_amount: amount,
            previous_balance,
            new_balance: invoice.balance_due(),
            invoice_status: invoice.status(),
        });
        events.push(AllocationEvent::AllocationReversed(AllocationReversed {
            allocation_id: allocation.id_typed(),
            payment_id,
            invoice_id,
            amount,
            previous_balance,
            new_balance: invoice.balance_due(),
            invoice_status: invoice.status(),
            reason: reason.clone(),
            occurred_at: now,
        }));
    }

    for invoice in invoices.values() {
        uow.save_invoice(invoice).await?;
    }
    for payment in payments.values() {
        uow.save_payment(payment).await?;
    }

    Ok(Reversed {
        lines,
        events,
        payments,
    })
}

async fn lock_active_allocation(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    allocation_id: AllocationId,
) -> DomainResult<Allocation> {
    let allocation = uow
        .lock_allocation(allocation_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("allocation {allocation_id}")))?;
    ensure_tenant(&allocation, company_id)?;
    if !allocation.is_active() {
        return Err(DomainError::validation(format!(
            "allocation {allocation_id} is already reversed"
        )));
    }
    Ok(allocation)
}

/// Lock the payments behind `allocations`, in payment id order.
async fn lock_payments(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    allocations: &[Allocation],
) -> DomainResult<BTreeMap<PaymentId, Payment>> {
    let ids: BTreeSet<PaymentId> = allocations.iter().map(Allocation::payment_id).collect();

    let mut payments = BTreeMap::new();
    for payment_id in ids {
        payments.insert(payment_id, load_payment(uow, company_id, payment_id).await?);
    }
    Ok(payments)
}

async fn load_payment(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    payment_id: PaymentId,
) -> DomainResult<Payment> {
    uow.lock_payment(company_id, payment_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("payment {payment_id}")))
}

async fn load_invoice(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    invoice_id: InvoiceId,
) -> DomainResult<Invoice> {
    let invoice = uow
        .lock_invoice(invoice_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("invoice {invoice_id}")))?;

    if invoice.company_id() != company_id {
        return Err(DomainError::cross_tenant(
            format!("invoice {invoice_id}"),
            company_id,
            invoice.company_id(),
        ));
    }
    Ok(invoice)
}

fn ensure_tenant(allocation: &Allocation, company_id: CompanyId) -> DomainResult<()> {
    if allocation.company_id() != company_id {
        return Err(DomainError::cross_tenant(
            format!("allocation {}", allocation.id_typed()),
            company_id,
            allocation.company_id(),
        ));
    }
    Ok(())
}

/// Reject an empty or repeating list of allocation ids.
fn distinct_ids(allocation_ids: &[AllocationId]) -> DomainResult<Vec<AllocationId>> {
    if allocation_ids.is_empty() {
        return Err(DomainError::validation("no allocations given"));
    }
    let mut seen = BTreeSet::new();
    if let Some(repeated) = allocation_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(DomainError::validation(format!(
            "allocation {repeated} is listed more than once"
        )));
    }
    Ok(allocation_ids.to_vec())
}

fn reversal_reason(reason: &str) -> DomainResult<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(DomainError::validation("a reversal reason is required"));
    }
    Ok(reason.to_string())
}

fn outcome_for(payment: &Payment, lines: Vec<AllocationLineResult>) -> AllocationOutcome {
    AllocationOutcome {
        payment_id: payment.id_typed(),
        lines,
        total_allocated: payment.total_allocated(),
        remaining_amount: payment.remaining_amount(),
        allocation_status: payment.allocation_status(),
    }
}
