use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::money::{self, STATUS_TOLERANCE};
use payalloc_core::{
    CompanyId, CustomerId, DomainError, DomainResult, Entity, PaymentId, Versioned,
};

/// Processing status of a received payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Void,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Void => "void",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "void" => Ok(PaymentStatus::Void),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(DomainError::validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// How much of a payment has been distributed. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Unallocated,
    PartiallyAllocated,
    FullyAllocated,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Unallocated => "unallocated",
            AllocationStatus::PartiallyAllocated => "partially_allocated",
            AllocationStatus::FullyAllocated => "fully_allocated",
        }
    }
}

/// Stored payment attributes plus the allocated total computed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentParts {
    pub id: PaymentId,
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub payment_number: String,
    pub amount: Decimal,
    pub processing_fee: Decimal,
    pub status: PaymentStatus,
    pub currency: String,
    pub received_at: DateTime<Utc>,
    /// Sum of the payment's non-reversed allocations.
    pub total_allocated: Decimal,
    pub version: u64,
}

/// A received payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    id: PaymentId,
    company_id: CompanyId,
    customer_id: CustomerId,
    payment_number: String,
    amount: Decimal,
    processing_fee: Decimal,
    net_amount: Decimal,
    status: PaymentStatus,
    currency: String,
    received_at: DateTime<Utc>,
    total_allocated: Decimal,
    version: u64,
}

impl Payment {
    pub fn from_parts(parts: PaymentParts) -> DomainResult<Self> {
        if parts.amount < Decimal::ZERO || parts.processing_fee < Decimal::ZERO {
            return Err(DomainError::validation(
                "payment amount and fee must not be negative",
            ));
        }
        if parts.processing_fee > parts.amount {
            return Err(DomainError::validation(format!(
                "processing fee {} exceeds payment amount {}",
                parts.processing_fee, parts.amount
            )));
        }
        if parts.total_allocated < Decimal::ZERO {
            return Err(DomainError::validation(
                "allocated total must not be negative",
            ));
        }

        Ok(Self {
            id: parts.id,
            company_id: parts.company_id,
            customer_id: parts.customer_id,
            payment_number: parts.payment_number,
            net_amount: parts.amount - parts.processing_fee,
            amount: parts.amount,
            processing_fee: parts.processing_fee,
            status: parts.status,
            currency: parts.currency,
            received_at: parts.received_at,
            total_allocated: parts.total_allocated,
            version: parts.version,
        })
    }

    pub fn to_parts(&self) -> PaymentParts {
        PaymentParts {
            id: self.id,
            company_id: self.company_id,
            customer_id: self.customer_id,
            payment_number: self.payment_number.clone(),
            amount: self.amount,
            processing_fee: self.processing_fee,
            status: self.status,
            currency: self.currency.clone(),
            received_at: self.received_at,
            total_allocated: self.total_allocated,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn payment_number(&self) -> &str {
        &self.payment_number
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn processing_fee(&self) -> Decimal {
        self.processing_fee
    }

    /// Gross amount minus processing fee; the ceiling for allocations.
    pub fn net_amount(&self) -> Decimal {
        self.net_amount
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn total_allocated(&self) -> Decimal {
        self.total_allocated
    }

    /// What can still be allocated. Never negative.
    pub fn remaining_amount(&self) -> Decimal {
        money::non_negative(self.net_amount - self.total_allocated)
    }

    pub fn is_fully_allocated(&self) -> bool {
        money::is_negligible(self.remaining_amount())
    }

    pub fn allocation_status(&self) -> AllocationStatus {
        if self.total_allocated <= STATUS_TOLERANCE {
            AllocationStatus::Unallocated
        } else if self.is_fully_allocated() {
            AllocationStatus::FullyAllocated
        } else {
            AllocationStatus::PartiallyAllocated
        }
    }

    /// Only completed payments may be distributed across invoices.
    pub fn ensure_allocatable(&self) -> DomainResult<()> {
        if self.status != PaymentStatus::Completed {
            return Err(DomainError::validation(format!(
                "payment {} is {} and cannot be allocated",
                self.payment_number, self.status
            )));
        }
        Ok(())
    }

    /// Count `amount` as allocated.
    pub fn record_allocation(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::invalid_allocation(
                "allocated amount must be positive",
            ));
        }
        if amount > self.remaining_amount() {
            return Err(DomainError::validation(format!(
                "amount {amount} exceeds remaining {} on payment {}",
                self.remaining_amount(),
                self.payment_number
            )));
        }

        self.total_allocated += amount;
        Ok(())
    }

    /// Give back `amount` from a reversed allocation.
    pub fn release_allocation(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::invalid_allocation(
                "released amount must be positive",
            ));
        }
        if amount > self.total_allocated {
            return Err(DomainError::invalid_allocation(format!(
                "cannot release {amount}: payment {} only has {} allocated",
                self.payment_number, self.total_allocated
            )));
        }

        self.total_allocated -= amount;
        Ok(())
    }

    /// Set status to completed. Returns whether anything changed.
    pub fn mark_completed(&mut self) -> bool {
        if self.status == PaymentStatus::Completed {
            return false;
        }
        self.status = PaymentStatus::Completed;
        true
    }
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

impl Versioned for Payment {
    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_payment(amount: Decimal, fee: Decimal, allocated: Decimal) -> Payment {
        Payment::from_parts(PaymentParts {
            id: PaymentId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            payment_number: "PAY-0001".to_string(),
            amount,
            processing_fee: fee,
            status: PaymentStatus::Completed,
            currency: "USD".to_string(),
            received_at: Utc::now(),
            total_allocated: allocated,
            version: 1,
        })
        .unwrap()
    }

    #[test]
    fn remaining_is_net_of_fee_and_allocations() {
        let payment = test_payment(dec!(100), dec!(2.50), dec!(40));

        assert_eq!(payment.net_amount(), dec!(97.50));
        assert_eq!(payment.remaining_amount(), dec!(57.50));
        assert_eq!(
            payment.allocation_status(),
            AllocationStatus::PartiallyAllocated
        );
    }

    #[test]
    fn allocation_status_follows_totals() {
        let mut payment = test_payment(dec!(120), dec!(0), dec!(0));
        assert_eq!(payment.allocation_status(), AllocationStatus::Unallocated);

        payment.record_allocation(dec!(100)).unwrap();
        assert_eq!(
            payment.allocation_status(),
            AllocationStatus::PartiallyAllocated
        );

        payment.record_allocation(dec!(19.995)).unwrap();
        assert!(payment.is_fully_allocated());
        assert_eq!(payment.allocation_status(), AllocationStatus::FullyAllocated);

        payment.release_allocation(dec!(119.995)).unwrap();
        assert_eq!(payment.allocation_status(), AllocationStatus::Unallocated);
    }

    #[test]
    fn cannot_allocate_beyond_remaining() {
        let mut payment = test_payment(dec!(50), dec!(0), dec!(10));

        let err = payment.record_allocation(dec!(40.01)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(payment.total_allocated(), dec!(10));
    }

    #[test]
    fn fee_above_amount_is_rejected() {
        let err = Payment::from_parts(PaymentParts {
            id: PaymentId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            payment_number: "PAY-0002".to_string(),
            amount: dec!(10),
            processing_fee: dec!(11),
            status: PaymentStatus::Completed,
            currency: "USD".to_string(),
            received_at: Utc::now(),
            total_allocated: dec!(0),
            version: 0,
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn only_completed_payments_are_allocatable() {
        let mut parts = PaymentParts {
            id: PaymentId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            payment_number: "PAY-0003".to_string(),
            amount: dec!(10),
            processing_fee: dec!(0),
            status: PaymentStatus::Pending,
            currency: "USD".to_string(),
            received_at: Utc::now(),
            total_allocated: dec!(0),
            version: 0,
        };
        assert!(Payment::from_parts(parts.clone()).unwrap().ensure_allocatable().is_err());

        parts.status = PaymentStatus::Completed;
        let mut payment = Payment::from_parts(parts).unwrap();
        assert!(payment.ensure_allocatable().is_ok());
        assert!(!payment.mark_completed());
    }
}
