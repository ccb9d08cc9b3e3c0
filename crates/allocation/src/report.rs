//! Read-only projections over allocations: per-payment summary, customer
//! balance, period reporting and reversal previews.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::{
    AllocationId, CompanyId, CustomerId, DomainError, DomainResult, Entity, InvoiceId, PaymentId,
};
use payalloc_invoicing::{Invoice, InvoiceStatus};
use payalloc_payments::{AllocationStatus, Payment, PaymentStatus};

use crate::record::{Allocation, AllocationMethod};
use crate::repository::AllocationDetail;
use crate::strategy::AllocationStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSummaryLine {
    pub allocation_id: AllocationId,
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub allocated_amount: Decimal,
    pub allocation_date: DateTime<Utc>,
    pub method: AllocationMethod,
    pub strategy: Option<AllocationStrategy>,
    pub notes: Option<String>,
}

/// Where a payment's money went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub payment_id: PaymentId,
    pub payment_number: String,
    pub net_amount: Decimal,
    pub total_allocated: Decimal,
    pub remaining_amount: Decimal,
    pub allocation_status: AllocationStatus,
    /// Non-reversed allocations ordered by date, then id.
    pub allocations: Vec<AllocationSummaryLine>,
}

impl AllocationSummary {
    pub fn build(payment: &Payment, details: Vec<AllocationDetail>) -> Self {
        let mut allocations: Vec<AllocationSummaryLine> = details
            .into_iter()
            .filter(|detail| detail.allocation.is_active())
            .map(|detail| {
                let allocation = detail.allocation;
                AllocationSummaryLine {
                    allocation_id: allocation.id_typed(),
                    invoice_id: allocation.invoice_id(),
                    invoice_number: detail.invoice_number,
                    allocated_amount: allocation.allocated_amount(),
                    allocation_date: allocation.allocation_date(),
                    method: allocation.method(),
                    strategy: allocation.strategy(),
                    notes: allocation.notes().map(str::to_owned),
                }
            })
            .collect();
        allocations.sort_by(|a, b| {
            a.allocation_date
                .cmp(&b.allocation_date)
                .then_with(|| a.allocation_id.cmp(&b.allocation_id))
        });

        Self {
            payment_id: payment.id_typed(),
            payment_number: payment.payment_number().to_string(),
            net_amount: payment.net_amount(),
            total_allocated: payment.total_allocated(),
            remaining_amount: payment.remaining_amount(),
            allocation_status: payment.allocation_status(),
            allocations,
        }
    }
}

/// What a customer owes against what they have paid but not yet allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerBalance {
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub open_invoice_count: usize,
    pub total_balance_due: Decimal,
    /// Unallocated remainder of completed payments.
    pub unallocated_credit: Decimal,
    /// Balance due minus credit; negative when the customer is in credit.
    pub net_balance: Decimal,
}

impl CustomerBalance {
    pub fn compute(
        company_id: CompanyId,
        customer_id: CustomerId,
        invoices: &[Invoice],
        payments: &[Payment],
    ) -> Self {
        let open: Vec<&Invoice> = invoices
            .iter()
            .filter(|inv| {
                inv.company_id() == company_id && inv.customer_id() == customer_id && inv.is_open()
            })
            .collect();
        let total_balance_due: Decimal = open.iter().map(|inv| inv.balance_due()).sum();

        let unallocated_credit: Decimal = payments
            .iter()
            .filter(|p| {
                p.company_id() == company_id
                    && p.customer_id() == customer_id
                    && p.status() == PaymentStatus::Completed
            })
            .map(|p| p.remaining_amount())
            .sum();

        Self {
            company_id,
            customer_id,
            open_invoice_count: open.len(),
            total_balance_due,
            unallocated_credit,
            net_balance: total_balance_due - unallocated_credit,
        }
    }
}

/// Count and sum of a group of allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBucket {
    pub count: usize,
    pub amount: Decimal,
}

impl ReportBucket {
    fn add(&mut self, amount: Decimal) {
        self.count += 1;
        self.amount += amount;
    }
}

/// Allocation activity of a company over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub company_id: CompanyId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Allocations still in effect.
    pub active: ReportBucket,
    pub reversed: ReportBucket,
    pub average_allocation: Decimal,
    pub unique_invoices: usize,
    pub unique_payments: usize,
    pub by_method: BTreeMap<AllocationMethod, ReportBucket>,
    pub by_strategy: BTreeMap<AllocationStrategy, ReportBucket>,
}

impl AllocationReport {
    pub fn build(
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        allocations: &[Allocation],
    ) -> Self {
        let mut active = ReportBucket::default();
        let mut reversed = ReportBucket::default();
        let mut by_method: BTreeMap<AllocationMethod, ReportBucket> = BTreeMap::new();
        let mut by_strategy: BTreeMap<AllocationStrategy, ReportBucket> = BTreeMap::new();
        let mut invoices = BTreeSet::new();
        let mut payments = BTreeSet::new();

        let in_scope = allocations.iter().filter(|a| {
            a.company_id() == company_id && a.allocation_date() >= from && a.allocation_date() <= to
        });

        for allocation in in_scope {
            let amount = allocation.allocated_amount();
            if !allocation.is_active() {
                reversed.add(amount);
                continue;
            }

            active.add(amount);
            by_method.entry(allocation.method()).or_default().add(amount);
            if let Some(strategy) = allocation.strategy() {
                by_strategy.entry(strategy).or_default().add(amount);
            }
            invoices.insert(allocation.invoice_id());
            payments.insert(allocation.payment_id());
        }

        let average_allocation = if active.count == 0 {
            Decimal::ZERO
        } else {
            payalloc_core::money::round_money(active.amount / Decimal::from(active.count))
        };

        Self {
            company_id,
            from,
            to,
            active,
            reversed,
            average_allocation,
            unique_invoices: invoices.len(),
            unique_payments: payments.len(),
            by_method,
            by_strategy,
        }
    }
}

/// How reversing a set of allocations would move one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceImpact {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub reversal_amount: Decimal,
    pub current_balance_due: Decimal,
    pub current_status: InvoiceStatus,
    pub projected_balance_due: Decimal,
    pub projected_status: InvoiceStatus,
}

/// How reversing a set of allocations would move one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentImpact {
    pub payment_id: PaymentId,
    pub payment_number: String,
    pub reversal_amount: Decimal,
    pub current_total_allocated: Decimal,
    pub current_remaining_amount: Decimal,
    pub projected_total_allocated: Decimal,
    pub projected_remaining_amount: Decimal,
    pub projected_status: AllocationStatus,
}

/// Preview of a reversal, computed without writing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalImpact {
    pub total_reversal_amount: Decimal,
    pub invoices: Vec<InvoiceImpact>,
    pub payments: Vec<PaymentImpact>,
    /// Requested allocations that are no longer active; they would be skipped.
    pub already_reversed: Vec<AllocationId>,
    /// Reasons the reversal would be refused as a whole.
    pub blockers: Vec<String>,
}

impl ReversalImpact {
    /// Project reversing the active `allocations` onto the invoices and
    /// payments they were applied to. Both maps must hold every row referenced.
    pub fn project(
        allocations: &[Allocation],
        invoices: &BTreeMap<InvoiceId, Invoice>,
        payments: &BTreeMap<PaymentId, Payment>,
    ) -> DomainResult<Self> {
        let mut already_reversed = Vec::new();
        let mut by_invoice: BTreeMap<InvoiceId, Decimal> = BTreeMap::new();
        let mut by_payment: BTreeMap<PaymentId, Decimal> = BTreeMap::new();

        for allocation in allocations {
            if !allocation.is_active() {
                already_reversed.push(allocation.id_typed());
                continue;
            }
            *by_invoice.entry(allocation.invoice_id()).or_default() += allocation.allocated_amount();
            *by_payment.entry(allocation.payment_id()).or_default() += allocation.allocated_amount();
        }

        let mut blockers = Vec::new();
        let mut invoice_impacts = Vec::with_capacity(by_invoice.len());
        for (invoice_id, amount) in by_invoice {
            let invoice = invoices
                .get(&invoice_id)
                .ok_or_else(|| DomainError::not_found(format!("invoice {invoice_id}")))?;

            let mut projected = invoice.clone();
            if invoice.status() == InvoiceStatus::Cancelled {
                blockers.push(format!("invoice {} is cancelled", invoice.invoice_number()));
            } else {
                projected.reverse_amount(amount)?;
            }

            invoice_impacts.push(InvoiceImpact {
                invoice_id,
                invoice_number: invoice.invoice_number().to_string(),
                reversal_amount: amount,
                current_balance_due: invoice.balance_due(),
                current_status: invoice.status(),
                projected_balance_due: projected.balance_due(),
                projected_status: projected.status(),
            });
        }

        let mut payment_impacts = Vec::with_capacity(by_payment.len());
        for (payment_id, amount) in by_payment {
            let payment = payments
                .get(&payment_id)
                .ok_or_else(|| DomainError::not_found(format!("payment {payment_id}")))?;

            let mut projected = payment.clone();
            projected.release_allocation(amount)?;

            payment_impacts.push(PaymentImpact {
                payment_id,
                payment_number: payment.payment_number().to_string(),
                reversal_amount: amount,
                current_total_allocated: payment.total_allocated(),
                current_remaining_amount: payment.remaining_amount(),
                projected_total_allocated: projected.total_allocated(),
                projected_remaining_amount: projected.remaining_amount(),
                projected_status: projected.allocation_status(),
            });
        }

        Ok(Self {
            total_reversal_amount: payment_impacts.iter().map(|p| p.reversal_amount).sum(),
            invoices: invoice_impacts,
            payments: payment_impacts,
            already_reversed,
            blockers,
        })
    }

    /// Whether reversing would change anything and nothing refuses it.
    pub fn is_reversible(&self) -> bool {
        self.blockers.is_empty() && !self.invoices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use payalloc_core::UserId;
    use payalloc_invoicing::{InvoiceParts, InvoiceStatus};
    use payalloc_payments::PaymentParts;
    use rust_decimal_macros::dec;

    use crate::record::AllocationParts;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 10, 0, 0).unwrap()
    }

    fn allocation(
        company_id: CompanyId,
        payment_id: PaymentId,
        invoice_id: InvoiceId,
        amount: Decimal,
        day: u32,
        strategy: Option<AllocationStrategy>,
    ) -> Allocation {
        Allocation::from_parts(AllocationParts {
            id: AllocationId::new(),
            company_id,
            payment_id,
            invoice_id,
            allocated_amount: amount,
            allocation_date: at(day),
            method: if strategy.is_some() {
                AllocationMethod::Automatic
            } else {
                AllocationMethod::Manual
            },
            strategy,
            notes: None,
            created_by: UserId::new(),
            reversal: None,
        })
        .unwrap()
    }

    fn payment(company_id: CompanyId, customer_id: CustomerId, net: Decimal, allocated: Decimal) -> Payment {
        Payment::from_parts(PaymentParts {
            id: PaymentId::new(),
            company_id,
            customer_id,
            payment_number: "PAY-1".to_string(),
            amount: net,
            processing_fee: Decimal::ZERO,
            status: PaymentStatus::Completed,
            currency: "USD".to_string(),
            received_at: at(1),
            total_allocated: allocated,
            version: 1,
        })
        .unwrap()
    }

    #[test]
    fn summary_orders_by_date_then_id_and_skips_reversed() {
        let company = CompanyId::new();
        let pay = payment(company, CustomerId::new(), dec!(100), dec!(60));

        let later = allocation(company, pay.id_typed(), InvoiceId::new(), dec!(40), 3, None);
        let earlier = allocation(company, pay.id_typed(), InvoiceId::new(), dec!(20), 2, None);
        let mut undone = allocation(company, pay.id_typed(), InvoiceId::new(), dec!(5), 1, None);
        undone.reverse(UserId::new(), "typo", at(4)).unwrap();

        let details = vec![later.clone(), undone, earlier.clone()]
            .into_iter()
            .map(|allocation| AllocationDetail {
                allocation,
                invoice_number: "INV".to_string(),
            })
            .collect();

        let summary = AllocationSummary::build(&pay, details);

        let ids: Vec<_> = summary.allocations.iter().map(|l| l.allocation_id).collect();
        assert_eq!(ids, vec![earlier.id_typed(), later.id_typed()]);
        assert_eq!(summary.remaining_amount, dec!(40));
        assert_eq!(summary.allocation_status, AllocationStatus::PartiallyAllocated);
    }

    #[test]
    fn customer_balance_nets_credit_against_open_invoices() {
        let company = CompanyId::new();
        let customer = CustomerId::new();

        let open = Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id: company,
            customer_id: customer,
            invoice_number: "INV-1".to_string(),
            total_amount: dec!(250),
            paid_amount: dec!(50),
            status: InvoiceStatus::Partial,
            due_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            created_at: at(1),
            version: 1,
        })
        .unwrap();
        let cancelled = Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id: company,
            customer_id: customer,
            invoice_number: "INV-2".to_string(),
            total_amount: dec!(999),
            paid_amount: dec!(0),
            status: InvoiceStatus::Cancelled,
            due_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            created_at: at(1),
            version: 1,
        })
        .unwrap();

        let payments = vec![
            payment(company, customer, dec!(100), dec!(70)),
            payment(company, CustomerId::new(), dec!(500), dec!(0)),
        ];

        let balance = CustomerBalance::compute(company, customer, &[open, cancelled], &payments);

        assert_eq!(balance.open_invoice_count, 1);
        assert_eq!(balance.total_balance_due, dec!(200));
        assert_eq!(balance.unallocated_credit, dec!(30));
        assert_eq!(balance.net_balance, dec!(170));
    }

    #[test]
    fn report_groups_active_allocations_and_counts_reversals() {
        let company = CompanyId::new();
        let pay_a = PaymentId::new();
        let pay_b = PaymentId::new();
        let inv = InvoiceId::new();

        let mut reversed = allocation(company, pay_a, inv, dec!(10), 2, None);
        reversed.reverse(UserId::new(), "wrong invoice", at(3)).unwrap();

        let allocations = vec![
            allocation(company, pay_a, inv, dec!(30), 2, Some(AllocationStrategy::Fifo)),
            allocation(company, pay_b, InvoiceId::new(), dec!(20), 3, Some(AllocationStrategy::Fifo)),
            allocation(company, pay_b, inv, dec!(25), 4, None),
            allocation(company, pay_b, inv, dec!(99), 20, None),
            allocation(CompanyId::new(), pay_b, inv, dec!(99), 3, None),
            reversed,
        ];

        let report = AllocationReport::build(company, at(1), at(1) + Duration::days(10), &allocations);

        assert_eq!(report.active, ReportBucket { count: 3, amount: dec!(75) });
        assert_eq!(report.reversed, ReportBucket { count: 1, amount: dec!(10) });
        assert_eq!(report.average_allocation, dec!(25));
        assert_eq!(report.unique_invoices, 2);
        assert_eq!(report.unique_payments, 2);
        assert_eq!(
            report.by_method[&AllocationMethod::Automatic],
            ReportBucket { count: 2, amount: dec!(50) }
        );
        assert_eq!(
            report.by_method[&AllocationMethod::Manual],
            ReportBucket { count: 1, amount: dec!(25) }
        );
        assert_eq!(
            report.by_strategy[&AllocationStrategy::Fifo],
            ReportBucket { count: 2, amount: dec!(50) }
        );
    }

    fn invoice(company_id: CompanyId, total: Decimal, paid: Decimal, status: InvoiceStatus) -> Invoice {
        Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id,
            customer_id: CustomerId::new(),
            invoice_number: "INV-7".to_string(),
            total_amount: total,
            paid_amount: paid,
            status,
            due_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            created_at: at(1),
            version: 1,
        })
        .unwrap()
    }

    #[test]
    fn reversal_impact_projects_invoice_and_payment_state() {
        let company = CompanyId::new();
        let paid = invoice(company, dec!(100), dec!(100), InvoiceStatus::Paid);
        let pay = payment(company, CustomerId::new(), dec!(150), dec!(120));

        let first = allocation(company, pay.id_typed(), paid.id_typed(), dec!(60), 1, None);
        let second = allocation(company, pay.id_typed(), paid.id_typed(), dec!(40), 2, None);
        let mut undone = allocation(company, pay.id_typed(), paid.id_typed(), dec!(5), 3, None);
        undone.reverse(UserId::new(), "typo", at(4)).unwrap();

        let invoices = BTreeMap::from([(paid.id_typed(), paid.clone())]);
        let payments = BTreeMap::from([(pay.id_typed(), pay.clone())]);

        let impact =
            ReversalImpact::project(&[first, second, undone.clone()], &invoices, &payments).unwrap();

        assert!(impact.is_reversible());
        assert_eq!(impact.total_reversal_amount, dec!(100));
        assert_eq!(impact.already_reversed, vec![undone.id_typed()]);

        let on_invoice = &impact.invoices[0];
        assert_eq!(on_invoice.current_balance_due, Decimal::ZERO);
        assert_eq!(on_invoice.projected_balance_due, dec!(100));
        assert_eq!(on_invoice.projected_status, InvoiceStatus::Pending);

        let on_payment = &impact.payments[0];
        assert_eq!(on_payment.projected_total_allocated, dec!(20));
        assert_eq!(on_payment.projected_remaining_amount, dec!(130));
        assert_eq!(on_payment.projected_status, AllocationStatus::PartiallyAllocated);

        // Nothing was touched.
        assert_eq!(invoices[&paid.id_typed()], paid);
        assert_eq!(payments[&pay.id_typed()], pay);
    }

    #[test]
    fn reversal_impact_reports_cancelled_invoices_as_blockers() {
        let company = CompanyId::new();
        let cancelled = invoice(company, dec!(50), dec!(20), InvoiceStatus::Cancelled);
        let pay = payment(company, CustomerId::new(), dec!(20), dec!(20));
        let applied = allocation(company, pay.id_typed(), cancelled.id_typed(), dec!(20), 1, None);

        let invoices = BTreeMap::from([(cancelled.id_typed(), cancelled)]);
        let payments = BTreeMap::from([(pay.id_typed(), pay)]);

        let impact = ReversalImpact::project(&[applied], &invoices, &payments).unwrap();

        assert!(!impact.is_reversible());
        assert_eq!(impact.blockers.len(), 1);
        assert_eq!(impact.invoices[0].projected_balance_due, dec!(30));
        assert_eq!(impact.invoices[0].projected_status, InvoiceStatus::Cancelled);
    }

    #[test]
    fn reversal_impact_of_reversed_allocations_is_empty() {
        let company = CompanyId::new();
        let pay = payment(company, CustomerId::new(), dec!(20), dec!(0));
        let mut undone = allocation(company, pay.id_typed(), InvoiceId::new(), dec!(10), 1, None);
        undone.reverse(UserId::new(), "typo", at(2)).unwrap();

        let impact = ReversalImpact::project(&[undone], &BTreeMap::new(), &BTreeMap::new()).unwrap();

        assert!(!impact.is_reversible());
        assert_eq!(impact.total_reversal_amount, Decimal::ZERO);
        assert_eq!(impact.already_reversed.len(), 1);
    }
}
