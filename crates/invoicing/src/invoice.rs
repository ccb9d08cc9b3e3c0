use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::money::{self, STATUS_TOLERANCE};
use payalloc_core::{
    CompanyId, CustomerId, DomainError, DomainResult, Entity, InvoiceId, Versioned,
};

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Partial,
    Paid,
    Void,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that can never receive an allocation.
    pub fn is_closed(self) -> bool {
        matches!(self, InvoiceStatus::Cancelled)
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "pending" => Ok(InvoiceStatus::Pending),
            "partial" => Ok(InvoiceStatus::Partial),
            "paid" => Ok(InvoiceStatus::Paid),
            "void" => Ok(InvoiceStatus::Void),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown invoice status '{other}'"
            ))),
        }
    }
}

/// Raw invoice attributes, as read from storage or supplied on creation.
///
/// `balance_due` is not part of it; it is always derived from total and paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceParts {
    pub id: InvoiceId,
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub invoice_number: String,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

/// An issued invoice and its receivable balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    company_id: CompanyId,
    customer_id: CustomerId,
    invoice_number: String,
    total_amount: Decimal,
    paid_amount: Decimal,
    balance_due: Decimal,
    status: InvoiceStatus,
    due_date: NaiveDate,
    created_at: DateTime<Utc>,
    version: u64,
}

impl Invoice {
    /// Build an invoice from its stored attributes.
    ///
    /// Rejects negative amounts and a paid amount above the total.
    pub fn from_parts(parts: InvoiceParts) -> DomainResult<Self> {
        if parts.total_amount < Decimal::ZERO {
            return Err(DomainError::validation("invoice total must not be negative"));
        }
        if parts.paid_amount < Decimal::ZERO {
            return Err(DomainError::validation(
                "invoice paid amount must not be negative",
            ));
        }
        if parts.paid_amount > parts.total_amount {
            return Err(DomainError::validation(format!(
                "invoice {} paid amount {} exceeds total {}",
                parts.invoice_number, parts.paid_amount, parts.total_amount
            )));
        }

        Ok(Self {
            id: parts.id,
            company_id: parts.company_id,
            customer_id: parts.customer_id,
            invoice_number: parts.invoice_number,
            balance_due: money::non_negative(parts.total_amount - parts.paid_amount),
            total_amount: parts.total_amount,
            paid_amount: parts.paid_amount,
            status: parts.status,
            due_date: parts.due_date,
            created_at: parts.created_at,
            version: parts.version,
        })
    }

    /// Stored attributes of this invoice, for persisting it.
    pub fn to_parts(&self) -> InvoiceParts {
        InvoiceParts {
            id: self.id,
            company_id: self.company_id,
            customer_id: self.customer_id,
            invoice_number: self.invoice_number.clone(),
            total_amount: self.total_amount,
            paid_amount: self.paid_amount,
            status: self.status,
            due_date: self.due_date,
            created_at: self.created_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    pub fn paid_amount(&self) -> Decimal {
        self.paid_amount
    }

    pub fn balance_due(&self) -> Decimal {
        self.balance_due
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn due_date(&self) -> NaiveDate {
        self.due_date
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Past due as of the given instant and still owing something.
    pub fn is_overdue(&self, as_of: DateTime<Utc>) -> bool {
        self.due_date < as_of.date_naive() && self.balance_due > Decimal::ZERO
    }

    /// Open for allocation: not cancelled, not paid, something left to pay.
    pub fn is_open(&self) -> bool {
        !self.status.is_closed()
            && self.status != InvoiceStatus::Paid
            && self.balance_due > Decimal::ZERO
    }

    /// Record `amount` as paid against this invoice.
    pub fn apply_amount(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::invalid_allocation(
                "allocated amount must be positive",
            ));
        }
        if amount > self.balance_due {
            return Err(DomainError::invalid_allocation(format!(
                "amount {amount} exceeds balance due {} on invoice {}",
                self.balance_due, self.invoice_number
            )));
        }

        self.paid_amount += amount;
        self.recalculate();
        Ok(())
    }

    /// Give back a previously applied `amount`.
    pub fn reverse_amount(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::invalid_allocation(
                "reversed amount must be positive",
            ));
        }
        if amount > self.paid_amount {
            return Err(DomainError::invalid_allocation(format!(
                "cannot reverse {amount}: invoice {} only has {} paid",
                self.invoice_number, self.paid_amount
            )));
        }

        self.paid_amount -= amount;
        self.recalculate();
        Ok(())
    }

    fn recalculate(&mut self) {
        self.balance_due = money::non_negative(self.total_amount - self.paid_amount);

        if self.paid_amount <= STATUS_TOLERANCE {
            // Nothing paid: only a previously paid-into invoice goes back to pending.
            if matches!(self.status, InvoiceStatus::Partial | InvoiceStatus::Paid) {
                self.status = InvoiceStatus::Pending;
            }
        } else if money::approx_eq(self.paid_amount, self.total_amount)
            || self.paid_amount >= self.total_amount
        {
            self.status = InvoiceStatus::Paid;
        } else {
            self.status = InvoiceStatus::Partial;
        }
    }
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

impl Versioned for Invoice {
    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_invoice(total: Decimal, paid: Decimal, status: InvoiceStatus) -> Invoice {
        Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            invoice_number: "INV-0001".to_string(),
            total_amount: total,
            paid_amount: paid,
            status,
            due_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            created_at: Utc::now(),
            version: 1,
        })
        .unwrap()
    }

    #[test]
    fn partial_then_full_payment_moves_status_forward() {
        let mut invoice = test_invoice(dec!(200), dec!(0), InvoiceStatus::Pending);

        invoice.apply_amount(dec!(50)).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Partial);
        assert_eq!(invoice.balance_due(), dec!(150));

        invoice.apply_amount(dec!(150)).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        assert_eq!(invoice.balance_due(), Decimal::ZERO);
        assert!(!invoice.is_open());
    }

    #[test]
    fn cannot_apply_more_than_balance_due() {
        let mut invoice = test_invoice(dec!(100), dec!(60), InvoiceStatus::Partial);

        let err = invoice.apply_amount(dec!(40.01)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidAllocation(_)));
        assert_eq!(invoice.paid_amount(), dec!(60));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut invoice = test_invoice(dec!(100), dec!(10), InvoiceStatus::Partial);

        assert!(invoice.apply_amount(dec!(0)).is_err());
        assert!(invoice.apply_amount(dec!(-1)).is_err());
        assert!(invoice.reverse_amount(dec!(0)).is_err());
    }

    #[test]
    fn reversing_everything_returns_to_pending() {
        let mut invoice = test_invoice(dec!(100), dec!(100), InvoiceStatus::Paid);

        invoice.reverse_amount(dec!(30)).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Partial);

        invoice.reverse_amount(dec!(70)).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Pending);
        assert_eq!(invoice.balance_due(), dec!(100));
    }

    #[test]
    fn cannot_reverse_more_than_paid() {
        let mut invoice = test_invoice(dec!(100), dec!(20), InvoiceStatus::Partial);

        let err = invoice.reverse_amount(dec!(20.01)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidAllocation(_)));
    }

    #[test]
    fn zero_paid_keeps_draft_status() {
        let invoice = test_invoice(dec!(100), dec!(0), InvoiceStatus::Draft);
        assert_eq!(invoice.status(), InvoiceStatus::Draft);
        assert!(invoice.is_open());
    }

    #[test]
    fn draft_and_void_invoices_accept_payment() {
        for status in [InvoiceStatus::Draft, InvoiceStatus::Void] {
            let mut invoice = test_invoice(dec!(100), dec!(0), status);
            assert!(invoice.is_open());

            invoice.apply_amount(dec!(40)).unwrap();
            assert_eq!(invoice.status(), InvoiceStatus::Partial);
            assert_eq!(invoice.balance_due(), dec!(60));
        }
    }

    #[test]
    fn cancelled_invoices_are_never_open() {
        let invoice = test_invoice(dec!(100), dec!(0), InvoiceStatus::Cancelled);
        assert!(invoice.status().is_closed());
        assert!(!invoice.is_open());
    }

    #[test]
    fn overdue_compares_due_date_with_as_of_date() {
        let invoice = test_invoice(dec!(100), dec!(0), InvoiceStatus::Pending);

        let on_due = DateTime::parse_from_rfc3339("2024-03-31T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let day_after = DateTime::parse_from_rfc3339("2024-04-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(!invoice.is_overdue(on_due));
        assert!(invoice.is_overdue(day_after));
    }

    #[test]
    fn from_parts_rejects_overpaid_invoice() {
        let err = Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            invoice_number: "INV-0002".to_string(),
            total_amount: dec!(10),
            paid_amount: dec!(11),
            status: InvoiceStatus::Paid,
            due_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            created_at: Utc::now(),
            version: 0,
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn status_parses_from_storage_names() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Pending,
            InvoiceStatus::Partial,
            InvoiceStatus::Paid,
            InvoiceStatus::Void,
            InvoiceStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<InvoiceStatus>().unwrap(), status);
        }
        assert!("overdue".parse::<InvoiceStatus>().is_err());
    }

    proptest! {
        #[test]
        fn paid_plus_balance_always_equals_total(
            total_cents in 1i64..1_000_000,
            steps in proptest::collection::vec((any::<bool>(), 1i64..100_000), 1..20),
        ) {
            let total = Decimal::new(total_cents, 2);
            let mut invoice = test_invoice(total, Decimal::ZERO, InvoiceStatus::Pending);

            for (apply, cents) in steps {
                let amount = Decimal::new(cents, 2);
                let _ = if apply {
                    invoice.apply_amount(amount)
                } else {
                    invoice.reverse_amount(amount)
                };

                prop_assert!(invoice.balance_due() >= Decimal::ZERO);
                prop_assert!(invoice.paid_amount() >= Decimal::ZERO);
                prop_assert_eq!(invoice.paid_amount() + invoice.balance_due(), total);
            }
        }
    }
}
