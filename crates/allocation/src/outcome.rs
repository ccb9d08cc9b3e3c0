//! Results returned by allocation writes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::{AllocationId, InvoiceId, PaymentId};
use payalloc_invoicing::InvoiceStatus;
use payalloc_payments::AllocationStatus;

/// What happened to one invoice in an allocation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLineResult {
    pub allocation_id: AllocationId,
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub allocated_amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub invoice_status: InvoiceStatus,
}

/// Result of a manual or strategy-driven allocation.
///
/// An automatic run with nothing to allocate returns an outcome with no lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub payment_id: PaymentId,
    pub lines: Vec<AllocationLineResult>,
    pub total_allocated: Decimal,
    pub remaining_amount: Decimal,
    pub allocation_status: AllocationStatus,
}

impl AllocationOutcome {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Sum of the amounts allocated by this batch alone.
    pub fn batch_total(&self) -> Decimal {
        self.lines.iter().map(|line| line.allocated_amount).sum()
    }
}

/// What happened to one invoice when an allocation was reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalLineResult {
    pub allocation_id: AllocationId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub reversed_amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub invoice_status: InvoiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalOutcome {
    pub payment_id: PaymentId,
    pub lines: Vec<ReversalLineResult>,
    pub total_reversed: Decimal,
    pub total_allocated: Decimal,
    pub remaining_amount: Decimal,
    pub allocation_status: AllocationStatus,
}

/// Where a payment stands once a batch reversal released money back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPosition {
    pub payment_id: PaymentId,
    pub payment_number: String,
    pub total_allocated: Decimal,
    pub remaining_amount: Decimal,
    pub allocation_status: AllocationStatus,
}

/// Result of a reversal whose allocations may come from several payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReversalOutcome {
    pub lines: Vec<ReversalLineResult>,
    pub total_reversed: Decimal,
    /// One entry per payment touched, in payment id order.
    pub payments: Vec<PaymentPosition>,
}
