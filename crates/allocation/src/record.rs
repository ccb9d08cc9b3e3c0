use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::{
    AllocationId, CompanyId, DomainError, DomainResult, Entity, InvoiceId, PaymentId, UserId,
};

use crate::strategy::AllocationStrategy;

/// How an allocation came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMethod {
    Manual,
    Automatic,
}

impl AllocationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationMethod::Manual => "manual",
            AllocationMethod::Automatic => "automatic",
        }
    }
}

impl core::fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for AllocationMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(AllocationMethod::Manual),
            "automatic" => Ok(AllocationMethod::Automatic),
            other => Err(DomainError::validation(format!(
                "unknown allocation method '{other}'"
            ))),
        }
    }
}

/// Who undid an allocation, when and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReversal {
    pub reversed_at: DateTime<Utc>,
    pub reversed_by: UserId,
    pub reason: String,
}

/// Stored allocation attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationParts {
    pub id: AllocationId,
    pub company_id: CompanyId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub allocated_amount: Decimal,
    pub allocation_date: DateTime<Utc>,
    pub method: AllocationMethod,
    pub strategy: Option<AllocationStrategy>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub reversal: Option<AllocationReversal>,
}

/// A portion of a payment applied to one invoice.
///
/// Rows are never deleted; undoing one marks it reversed and it stops counting
/// towards the payment's allocated total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    id: AllocationId,
    company_id: CompanyId,
    payment_id: PaymentId,
    invoice_id: InvoiceId,
    allocated_amount: Decimal,
    allocation_date: DateTime<Utc>,
    method: AllocationMethod,
    strategy: Option<AllocationStrategy>,
    notes: Option<String>,
    created_by: UserId,
    reversal: Option<AllocationReversal>,
}

impl Allocation {
    pub fn from_parts(parts: AllocationParts) -> DomainResult<Self> {
        if parts.allocated_amount <= Decimal::ZERO {
            return Err(DomainError::invalid_allocation(format!(
                "allocation {} has non-positive amount {}",
                parts.id, parts.allocated_amount
            )));
        }
        if parts.method == AllocationMethod::Manual && parts.strategy.is_some() {
            return Err(DomainError::validation(
                "manual allocations do not carry a strategy",
            ));
        }

        Ok(Self {
            id: parts.id,
            company_id: parts.company_id,
            payment_id: parts.payment_id,
            invoice_id: parts.invoice_id,
            allocated_amount: parts.allocated_amount,
            allocation_date: parts.allocation_date,
            method: parts.method,
            strategy: parts.strategy,
            notes: parts.notes,
            created_by: parts.created_by,
            reversal: parts.reversal,
        })
    }

    pub fn id_typed(&self) -> AllocationId {
        self.id
    }

    pub fn payment_id(&self) -> PaymentId {
        self.payment_id
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn allocated_amount(&self) -> Decimal {
        self.allocated_amount
    }

    pub fn allocation_date(&self) -> DateTime<Utc> {
        self.allocation_date
    }

    pub fn method(&self) -> AllocationMethod {
        self.method
    }

    pub fn strategy(&self) -> Option<AllocationStrategy> {
        self.strategy
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn reversal(&self) -> Option<&AllocationReversal> {
        self.reversal.as_ref()
    }

    /// Still counts towards the payment's allocated total.
    pub fn is_active(&self) -> bool {
        self.reversal.is_none()
    }

    pub fn reverse(
        &mut self,
        reversed_by: UserId,
        reason: impl Into<String>,
        reversed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if let Some(existing) = &self.reversal {
            return Err(DomainError::validation(format!(
                "allocation {} was already reversed at {}",
                self.id, existing.reversed_at
            )));
        }

        self.reversal = Some(AllocationReversal {
            reversed_at,
            reversed_by,
            reason: reason.into(),
        });
        Ok(())
    }
}

impl Entity for Allocation {
    type Id = AllocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parts(amount: Decimal) -> AllocationParts {
        AllocationParts {
            id: AllocationId::new(),
            company_id: CompanyId::new(),
            payment_id: PaymentId::new(),
            invoice_id: InvoiceId::new(),
            allocated_amount: amount,
            allocation_date: Utc::now(),
            method: AllocationMethod::Automatic,
            strategy: Some(AllocationStrategy::Fifo),
            notes: None,
            created_by: UserId::new(),
            reversal: None,
        }
    }

    #[test]
    fn rejects_non_positive_amount() {
        let err = Allocation::from_parts(parts(dec!(0))).unwrap_err();
        assert!(matches!(err, DomainError::InvalidAllocation(_)));
    }

    #[test]
    fn manual_allocation_cannot_name_a_strategy() {
        let mut p = parts(dec!(10));
        p.method = AllocationMethod::Manual;
        assert!(Allocation::from_parts(p).is_err());
    }

    #[test]
    fn reversing_twice_fails() {
        let mut allocation = Allocation::from_parts(parts(dec!(10))).unwrap();
        let user = UserId::new();

        allocation.reverse(user, "duplicate entry", Utc::now()).unwrap();
        assert!(!allocation.is_active());
        assert_eq!(allocation.reversal().unwrap().reversed_by, user);

        let err = allocation.reverse(user, "again", Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
