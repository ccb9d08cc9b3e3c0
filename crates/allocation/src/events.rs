//! Audit events emitted after allocation changes commit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::{AllocationId, InvoiceId, PaymentId};
use payalloc_events::Event;
use payalloc_invoicing::InvoiceStatus;

use crate::record::AllocationMethod;
use crate::strategy::AllocationStrategy;

/// Event: part of a payment was applied to an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationApplied {
    pub allocation_id: AllocationId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub invoice_status: InvoiceStatus,
    pub method: AllocationMethod,
    pub strategy: Option<AllocationStrategy>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: an allocation was undone and the invoice balance reinstated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReversed {
    pub allocation_id: AllocationId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub invoice_status: InvoiceStatus,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: nothing is left to allocate on a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFullyAllocated {
    pub payment_id: PaymentId,
    pub net_amount: Decimal,
    pub total_allocated: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: an automatic allocation found nothing to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSkipped {
    pub payment_id: PaymentId,
    pub strategy: AllocationStrategy,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationEvent {
    AllocationApplied(AllocationApplied),
    AllocationReversed(AllocationReversed),
    PaymentFullyAllocated(PaymentFullyAllocated),
    AllocationSkipped(AllocationSkipped),
}

impl AllocationEvent {
    /// The payment every allocation event ultimately concerns.
    pub fn payment_id(&self) -> PaymentId {
        match self {
            AllocationEvent::AllocationApplied(e) => e.payment_id,
            AllocationEvent::AllocationReversed(e) => e.payment_id,
            AllocationEvent::PaymentFullyAllocated(e) => e.payment_id,
            AllocationEvent::AllocationSkipped(e) => e.payment_id,
        }
    }
}

impl Event for AllocationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AllocationEvent::AllocationApplied(_) => "allocation.applied",
            AllocationEvent::AllocationReversed(_) => "allocation.reversed",
            AllocationEvent::PaymentFullyAllocated(_) => "payment.fully_allocated",
            AllocationEvent::AllocationSkipped(_) => "allocation.skipped",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AllocationEvent::AllocationApplied(e) => e.occurred_at,
            AllocationEvent::AllocationReversed(e) => e.occurred_at,
            AllocationEvent::PaymentFullyAllocated(e) => e.occurred_at,
            AllocationEvent::AllocationSkipped(e) => e.occurred_at,
        }
    }
}
