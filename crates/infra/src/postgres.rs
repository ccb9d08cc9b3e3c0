//! Postgres-backed allocation store.
//!
//! A unit of work is one database transaction. Rows read through it are
//! taken with `SELECT ... FOR UPDATE`, so concurrent allocations against the
//! same payment or invoice queue up behind each other instead of racing.
//! Saves are additionally guarded by the row `version`: an `UPDATE` that
//! matches zero rows means the row moved, and is reported as a conflict.
//!
//! The allocated total of a payment is never stored. Every payment query
//! computes it from the non-reversed `payment_allocations` rows.
//!
//! All amounts are `NUMERIC(15, 2)` columns read into `Decimal`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgExecutor, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use payalloc_allocation::{
    Allocation, AllocationDetail, AllocationMethod, AllocationParts, AllocationRepository,
    AllocationReversal, AllocationStrategy, UnitOfWork,
};
use payalloc_core::{
    AllocationId, CompanyId, CustomerId, DomainError, DomainResult, Entity, InvoiceId, PaymentId,
    UserId, Versioned,
};
use payalloc_invoicing::{Invoice, InvoiceParts, InvoiceStatus};
use payalloc_payments::{Payment, PaymentParts, PaymentStatus};

use crate::config::AllocationConfig;
use crate::error::{StoreError, map_sqlx_error};

const SCHEMA: &str = include_str!("../migrations/0001_payment_allocation.sql");

const INVOICE_SELECT: &str = r#"
    SELECT id, company_id, customer_id, invoice_number, total_amount, paid_amount,
           status, due_date, created_at, version
    FROM invoices
"#;

const PAYMENT_SELECT: &str = r#"
    SELECT p.id, p.company_id, p.customer_id, p.payment_number, p.amount, p.processing_fee,
           p.status, p.currency, p.received_at, p.version,
           COALESCE((
               SELECT SUM(a.allocated_amount)
               FROM payment_allocations a
               WHERE a.payment_id = p.id AND a.reversed_at IS NULL
           ), 0) AS total_allocated
    FROM payments p
"#;

const ALLOCATION_SELECT: &str = r#"
    SELECT id, company_id, payment_id, invoice_id, allocated_amount, allocation_date,
           allocation_method, allocation_strategy, notes, created_by,
           reversed_at, reversed_by, reversal_reason
    FROM payment_allocations
"#;

const OPEN_INVOICE_FILTER: &str = r#"
    WHERE company_id = $1 AND customer_id = $2
      AND status NOT IN ('paid', 'cancelled') AND balance_due > 0
    ORDER BY created_at ASC, id ASC
"#;

/// Postgres [`AllocationRepository`].
///
/// Every query is scoped by `company_id` except the by-id invoice and
/// allocation locks, whose callers check ownership themselves.
#[derive(Debug, Clone)]
pub struct PgAllocationStore {
    pool: Arc<PgPool>,
}

impl PgAllocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool sized and timed out per `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &AllocationConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        tracing::info!("connected to allocation database");
        Ok(Self::new(pool))
    }

    /// Create the allocation tables and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AllocationRepository for PgAllocationStore {
    async fn begin(&self) -> DomainResult<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    #[instrument(
        skip(self),
        fields(company_id = %company_id, payment_id = %payment_id),
        err
    )]
    async fn find_payment(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>> {
        let sql = format!("{PAYMENT_SELECT} WHERE p.company_id = $1 AND p.id = $2");
        Ok(fetch_payment(&*self.pool, &sql, "find_payment", company_id, payment_id).await?)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn find_invoice(&self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>> {
        const OPERATION: &str = "find_invoice";

        let sql = format!("{INVOICE_SELECT} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(invoice_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Ok(row
            .as_ref()
            .map(|row| invoice_from_row(OPERATION, row))
            .transpose()?)
    }

    #[instrument(skip(self), fields(allocation_id = %allocation_id), err)]
    async fn find_allocation(
        &self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>> {
        const OPERATION: &str = "find_allocation";

        let sql = format!("{ALLOCATION_SELECT} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(allocation_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Ok(row
            .as_ref()
            .map(|row| allocation_from_row(OPERATION, row))
            .transpose()?)
    }

    #[instrument(
        skip(self),
        fields(company_id = %company_id, payment_id = %payment_id, rows = field::Empty),
        err
    )]
    async fn active_allocation_details(
        &self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<AllocationDetail>> {
        const OPERATION: &str = "active_allocation_details";

        let rows = sqlx::query(
            r#"
            SELECT a.id, a.company_id, a.payment_id, a.invoice_id, a.allocated_amount,
                   a.allocation_date, a.allocation_method, a.allocation_strategy, a.notes,
                   a.created_by, a.reversed_at, a.reversed_by, a.reversal_reason,
                   i.invoice_number
            FROM payment_allocations a
            JOIN invoices i ON i.id = a.invoice_id
            WHERE a.company_id = $1 AND a.payment_id = $2 AND a.reversed_at IS NULL
            ORDER BY a.allocation_date ASC, a.id ASC
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(payment_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Span::current().record("rows", rows.len());

        let mut details = Vec::with_capacity(rows.len());
        for row in &rows {
            let invoice_number: String = row
                .try_get("invoice_number")
                .map_err(|e| map_sqlx_error(OPERATION, e))?;
            details.push(AllocationDetail {
                allocation: allocation_from_row(OPERATION, row)?,
                invoice_number,
            });
        }
        Ok(details)
    }

    async fn open_invoices(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>> {
        let sql = format!("{INVOICE_SELECT} {OPEN_INVOICE_FILTER}");
        Ok(fetch_open_invoices(&*self.pool, &sql, "open_invoices", company_id, customer_id).await?)
    }

    #[instrument(
        skip(self),
        fields(company_id = %company_id, customer_id = %customer_id),
        err
    )]
    async fn customer_payments(
        &self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Payment>> {
        const OPERATION: &str = "customer_payments";

        let sql = format!(
            "{PAYMENT_SELECT} WHERE p.company_id = $1 AND p.customer_id = $2 \
             ORDER BY p.received_at ASC, p.id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(customer_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        let payments = rows
            .iter()
            .map(|row| payment_from_row(OPERATION, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    #[instrument(skip(self), fields(company_id = %company_id, rows = field::Empty), err)]
    async fn allocations_between(
        &self,
        company_id: CompanyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<Allocation>> {
        const OPERATION: &str = "allocations_between";

        let sql = format!(
            "{ALLOCATION_SELECT} WHERE company_id = $1 \
             AND allocation_date >= $2 AND allocation_date <= $3 \
             ORDER BY allocation_date ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(from)
            .bind(to)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Span::current().record("rows", rows.len());

        let allocations = rows
            .iter()
            .map(|row| allocation_from_row(OPERATION, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allocations)
    }
}

/// One open transaction. Dropping it without commit rolls the transaction back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_payment(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Option<Payment>> {
        let sql =
            format!("{PAYMENT_SELECT} WHERE p.company_id = $1 AND p.id = $2 FOR UPDATE OF p");
        Ok(fetch_payment(&mut *self.tx, &sql, "lock_payment", company_id, payment_id).await?)
    }

    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> DomainResult<Option<Invoice>> {
        const OPERATION: &str = "lock_invoice";

        let sql = format!("{INVOICE_SELECT} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(invoice_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Ok(row
            .as_ref()
            .map(|row| invoice_from_row(OPERATION, row))
            .transpose()?)
    }

    async fn lock_open_invoices(
        &mut self,
        company_id: CompanyId,
        customer_id: CustomerId,
    ) -> DomainResult<Vec<Invoice>> {
        let sql = format!("{INVOICE_SELECT} {OPEN_INVOICE_FILTER} FOR UPDATE");
        Ok(
            fetch_open_invoices(&mut *self.tx, &sql, "lock_open_invoices", company_id, customer_id)
                .await?,
        )
    }

    async fn lock_allocation(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Option<Allocation>> {
        const OPERATION: &str = "lock_allocation";

        let sql = format!("{ALLOCATION_SELECT} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(allocation_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        Ok(row
            .as_ref()
            .map(|row| allocation_from_row(OPERATION, row))
            .transpose()?)
    }

    async fn lock_active_allocations(
        &mut self,
        company_id: CompanyId,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<Allocation>> {
        const OPERATION: &str = "lock_active_allocations";

        let sql = format!(
            "{ALLOCATION_SELECT} WHERE company_id = $1 AND payment_id = $2 \
             AND reversed_at IS NULL ORDER BY allocation_date ASC, id ASC FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(payment_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        let allocations = rows
            .iter()
            .map(|row| allocation_from_row(OPERATION, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allocations)
    }

    async fn lock_invoice_allocations(
        &mut self,
        company_id: CompanyId,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<Allocation>> {
        const OPERATION: &str = "lock_invoice_allocations";

        let sql = format!(
            "{ALLOCATION_SELECT} WHERE company_id = $1 AND invoice_id = $2 \
             AND reversed_at IS NULL ORDER BY allocation_date DESC, id DESC FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(invoice_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(OPERATION, e))?;

        let allocations = rows
            .iter()
            .map(|row| allocation_from_row(OPERATION, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allocations)
    }

    #[instrument(
        skip(self, allocation),
        fields(
            allocation_id = %allocation.id_typed(),
            invoice_id = %allocation.invoice_id(),
            amount = %allocation.allocated_amount()
        ),
        err
    )]
    async fn insert_allocation(&mut self, allocation: &Allocation) -> DomainResult<()> {
        let reversal = allocation.reversal();

        sqlx::query(
            r#"
            INSERT INTO payment_allocations (
                id,
                company_id,
                payment_id,
                invoice_id,
                allocated_amount,
                allocation_date,
                allocation_method,
                allocation_strategy,
                notes,
                created_by,
                reversed_at,
                reversed_by,
                reversal_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(allocation.id_typed().as_uuid())
        .bind(allocation.company_id().as_uuid())
        .bind(allocation.payment_id().as_uuid())
        .bind(allocation.invoice_id().as_uuid())
        .bind(allocation.allocated_amount())
        .bind(allocation.allocation_date())
        .bind(allocation.method().as_str())
        .bind(allocation.strategy().map(|s| s.as_str()))
        .bind(allocation.notes())
        .bind(allocation.created_by().as_uuid())
        .bind(reversal.map(|r| r.reversed_at))
        .bind(reversal.map(|r| r.reversed_by.as_uuid()))
        .bind(reversal.map(|r| r.reason.as_str()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_allocation", e))?;

        Ok(())
    }

    #[instrument(skip(self, allocation), fields(allocation_id = %allocation.id_typed()), err)]
    async fn mark_reversed(&mut self, allocation: &Allocation) -> DomainResult<()> {
        let reversal = allocation.reversal().ok_or_else(|| {
            DomainError::invalid_allocation(format!(
                "allocation {} carries no reversal to persist",
                allocation.id_typed()
            ))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE payment_allocations
            SET reversed_at = $1, reversed_by = $2, reversal_reason = $3
            WHERE id = $4 AND company_id = $5 AND reversed_at IS NULL
            "#,
        )
        .bind(reversal.reversed_at)
        .bind(reversal.reversed_by.as_uuid())
        .bind(reversal.reason.as_str())
        .bind(allocation.id_typed().as_uuid())
        .bind(allocation.company_id().as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_reversed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::conflict(
                "mark_reversed",
                format!("allocation {} is no longer active", allocation.id_typed()),
            )
            .into());
        }
        Ok(())
    }

    #[instrument(
        skip(self, invoice),
        fields(invoice_id = %invoice.id_typed(), version = invoice.version()),
        err
    )]
    async fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET paid_amount = $1,
                balance_due = $2,
                status = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $4 AND company_id = $5 AND version = $6
            "#,
        )
        .bind(invoice.paid_amount())
        .bind(invoice.balance_due())
        .bind(invoice.status().as_str())
        .bind(invoice.id_typed().as_uuid())
        .bind(invoice.company_id().as_uuid())
        .bind(db_version("save_invoice", invoice.version())?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_invoice", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::conflict(
                "save_invoice",
                format!(
                    "invoice {} is no longer at version {}",
                    invoice.invoice_number(),
                    invoice.version()
                ),
            )
            .into());
        }
        Ok(())
    }

    #[instrument(
        skip(self, payment),
        fields(payment_id = %payment.id_typed(), version = payment.version()),
        err
    )]
    async fn save_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $1,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $2 AND company_id = $3 AND version = $4
            "#,
        )
        .bind(payment.status().as_str())
        .bind(payment.id_typed().as_uuid())
        .bind(payment.company_id().as_uuid())
        .bind(db_version("save_payment", payment.version())?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_payment", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::conflict(
                "save_payment",
                format!(
                    "payment {} is no longer at version {}",
                    payment.payment_number(),
                    payment.version()
                ),
            )
            .into());
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DomainResult<()> {
        let PgUnitOfWork { tx } = *self;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DomainResult<()> {
        let PgUnitOfWork { tx } = *self;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        Ok(())
    }
}

async fn fetch_payment<'e, E>(
    executor: E,
    sql: &str,
    operation: &'static str,
    company_id: CompanyId,
    payment_id: PaymentId,
) -> Result<Option<Payment>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(sql)
        .bind(company_id.as_uuid())
        .bind(payment_id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    row.as_ref()
        .map(|row| payment_from_row(operation, row))
        .transpose()
}

async fn fetch_open_invoices<'e, E>(
    executor: E,
    sql: &str,
    operation: &'static str,
    company_id: CompanyId,
    customer_id: CustomerId,
) -> Result<Vec<Invoice>, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(sql)
        .bind(company_id.as_uuid())
        .bind(customer_id.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    rows.iter()
        .map(|row| invoice_from_row(operation, row))
        .collect()
}

fn db_version(operation: &'static str, version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::corrupt(operation, format!("version {version} out of range")))
}

fn domain_version(operation: &'static str, version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::corrupt(operation, format!("negative version {version}")))
}

fn corrupt(operation: &'static str) -> impl Fn(DomainError) -> StoreError {
    move |err| StoreError::corrupt(operation, err.to_string())
}

fn invoice_from_row(operation: &'static str, row: &PgRow) -> Result<Invoice, StoreError> {
    InvoiceRow::from_row(row)
        .map_err(|e| map_sqlx_error(operation, e))?
        .into_invoice(operation)
}

fn payment_from_row(operation: &'static str, row: &PgRow) -> Result<Payment, StoreError> {
    PaymentRow::from_row(row)
        .map_err(|e| map_sqlx_error(operation, e))?
        .into_payment(operation)
}

fn allocation_from_row(operation: &'static str, row: &PgRow) -> Result<Allocation, StoreError> {
    AllocationRow::from_row(row)
        .map_err(|e| map_sqlx_error(operation, e))?
        .into_allocation(operation)
}

struct InvoiceRow {
    id: Uuid,
    company_id: Uuid,
    customer_id: Uuid,
    invoice_number: String,
    total_amount: Decimal,
    paid_amount: Decimal,
    status: String,
    due_date: NaiveDate,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for InvoiceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            customer_id: row.try_get("customer_id")?,
            invoice_number: row.try_get("invoice_number")?,
            total_amount: row.try_get("total_amount")?,
            paid_amount: row.try_get("paid_amount")?,
            status: row.try_get("status")?,
            due_date: row.try_get("due_date")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl InvoiceRow {
    fn into_invoice(self, operation: &'static str) -> Result<Invoice, StoreError> {
        let status: InvoiceStatus = self.status.parse().map_err(corrupt(operation))?;

        Invoice::from_parts(InvoiceParts {
            id: InvoiceId::from_uuid(self.id),
            company_id: CompanyId::from_uuid(self.company_id),
            customer_id: CustomerId::from_uuid(self.customer_id),
            invoice_number: self.invoice_number,
            total_amount: self.total_amount,
            paid_amount: self.paid_amount,
            status,
            due_date: self.due_date,
            created_at: self.created_at,
            version: domain_version(operation, self.version)?,
        })
        .map_err(corrupt(operation))
    }
}

struct PaymentRow {
    id: Uuid,
    company_id: Uuid,
    customer_id: Uuid,
    payment_number: String,
    amount: Decimal,
    processing_fee: Decimal,
    status: String,
    currency: String,
    received_at: DateTime<Utc>,
    total_allocated: Decimal,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for PaymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            customer_id: row.try_get("customer_id")?,
            payment_number: row.try_get("payment_number")?,
            amount: row.try_get("amount")?,
            processing_fee: row.try_get("processing_fee")?,
            status: row.try_get("status")?,
            currency: row.try_get("currency")?,
            received_at: row.try_get("received_at")?,
            total_allocated: row.try_get("total_allocated")?,
            version: row.try_get("version")?,
        })
    }
}

impl PaymentRow {
    fn into_payment(self, operation: &'static str) -> Result<Payment, StoreError> {
        let status: PaymentStatus = self.status.parse().map_err(corrupt(operation))?;

        Payment::from_parts(PaymentParts {
            id: PaymentId::from_uuid(self.id),
            company_id: CompanyId::from_uuid(self.company_id),
            customer_id: CustomerId::from_uuid(self.customer_id),
            payment_number: self.payment_number,
            amount: self.amount,
            processing_fee: self.processing_fee,
            status,
            currency: self.currency,
            received_at: self.received_at,
            total_allocated: self.total_allocated,
            version: domain_version(operation, self.version)?,
        })
        .map_err(corrupt(operation))
    }
}

struct AllocationRow {
    id: Uuid,
    company_id: Uuid,
    payment_id: Uuid,
    invoice_id: Uuid,
    allocated_amount: Decimal,
    allocation_date: DateTime<Utc>,
    allocation_method: String,
    allocation_strategy: Option<String>,
    notes: Option<String>,
    created_by: Uuid,
    reversed_at: Option<DateTime<Utc>>,
    reversed_by: Option<Uuid>,
    reversal_reason: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for AllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            payment_id: row.try_get("payment_id")?,
            invoice_id: row.try_get("invoice_id")?,
            allocated_amount: row.try_get("allocated_amount")?,
            allocation_date: row.try_get("allocation_date")?,
            allocation_method: row.try_get("allocation_method")?,
            allocation_strategy: row.try_get("allocation_strategy")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            reversed_at: row.try_get("reversed_at")?,
            reversed_by: row.try_get("reversed_by")?,
            reversal_reason: row.try_get("reversal_reason")?,
        })
    }
}

impl AllocationRow {
    fn into_allocation(self, operation: &'static str) -> Result<Allocation, StoreError> {
        let method: AllocationMethod = self.allocation_method.parse().map_err(corrupt(operation))?;
        let strategy = self
            .allocation_strategy
            .as_deref()
            .map(str::parse::<AllocationStrategy>)
            .transpose()
            .map_err(corrupt(operation))?;

        let reversal = match (self.reversed_at, self.reversed_by) {
            (None, _) => None,
            (Some(reversed_at), Some(reversed_by)) => Some(AllocationReversal {
                reversed_at,
                reversed_by: UserId::from_uuid(reversed_by),
                reason: self.reversal_reason.unwrap_or_default(),
            }),
            (Some(_), None) => {
                return Err(StoreError::corrupt(
                    operation,
                    format!("allocation {} is reversed without a reversing user", self.id),
                ));
            }
        };

        Allocation::from_parts(AllocationParts {
            id: AllocationId::from_uuid(self.id),
            company_id: CompanyId::from_uuid(self.company_id),
            payment_id: PaymentId::from_uuid(self.payment_id),
            invoice_id: InvoiceId::from_uuid(self.invoice_id),
            allocated_amount: self.allocated_amount,
            allocation_date: self.allocation_date,
            method,
            strategy,
            notes: self.notes,
            created_by: UserId::from_uuid(self.created_by),
            reversal,
        })
        .map_err(corrupt(operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_outside_bigint_are_rejected() {
        assert_eq!(db_version("save_invoice", 7).unwrap(), 7);
        assert!(db_version("save_invoice", u64::MAX).is_err());
        assert!(domain_version("lock_invoice", -1).is_err());
    }

    #[test]
    fn open_invoice_filter_excludes_only_settled_statuses() {
        let excluded = format!(
            "status NOT IN ('{}', '{}')",
            InvoiceStatus::Paid.as_str(),
            InvoiceStatus::Cancelled.as_str()
        );
        assert!(OPEN_INVOICE_FILTER.contains(&excluded));
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Pending,
            InvoiceStatus::Partial,
            InvoiceStatus::Void,
        ] {
            assert!(!OPEN_INVOICE_FILTER.contains(&format!("'{}'", status.as_str())));
        }
        assert!(SCHEMA.contains(&format!("WHERE {excluded}")));
    }

    #[test]
    fn schema_declares_every_table() {
        for table in ["invoices", "payments", "payment_allocations"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
