//! Automatic allocation planning.
//!
//! A strategy turns "this much money" plus "these open invoices" into an
//! ordered list of planned amounts. Planning is pure: it reads invoices and
//! never mutates them; the orchestrator applies the plan.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use payalloc_core::money;
use payalloc_core::{DomainError, InvoiceId};
use payalloc_invoicing::Invoice;

/// Named rule for distributing a payment across open invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Oldest invoice first.
    Fifo,
    /// Newest invoice first.
    Lifo,
    /// Overdue invoices first, then by due date.
    OverdueFirst,
    /// Largest balance due first.
    LargestFirst,
    /// Smallest balance due first.
    SmallestFirst,
    /// Every open invoice gets a share proportional to its balance.
    Proportional,
}

/// One line of an allocation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub notes: String,
}

/// Catalogue entry describing a strategy to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyInfo {
    pub strategy: AllocationStrategy,
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub best_for: &'static str,
}

impl AllocationStrategy {
    pub const ALL: [AllocationStrategy; 6] = [
        AllocationStrategy::Fifo,
        AllocationStrategy::Lifo,
        AllocationStrategy::OverdueFirst,
        AllocationStrategy::LargestFirst,
        AllocationStrategy::SmallestFirst,
        AllocationStrategy::Proportional,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::Fifo => "fifo",
            AllocationStrategy::Lifo => "lifo",
            AllocationStrategy::OverdueFirst => "overdue_first",
            AllocationStrategy::LargestFirst => "largest_first",
            AllocationStrategy::SmallestFirst => "smallest_first",
            AllocationStrategy::Proportional => "proportional",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AllocationStrategy::Fifo => "First In, First Out (FIFO)",
            AllocationStrategy::Lifo => "Last In, First Out (LIFO)",
            AllocationStrategy::OverdueFirst => "Overdue Priority",
            AllocationStrategy::LargestFirst => "Largest Balance First",
            AllocationStrategy::SmallestFirst => "Smallest Balance First",
            AllocationStrategy::Proportional => "Proportional",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            AllocationStrategy::Fifo => "Pays the oldest invoices first",
            AllocationStrategy::Lifo => "Pays the most recently issued invoices first",
            AllocationStrategy::OverdueFirst => {
                "Prioritizes overdue invoices, earliest due date first"
            }
            AllocationStrategy::LargestFirst => "Pays invoices with the largest balances first",
            AllocationStrategy::SmallestFirst => {
                "Pays invoices with the smallest balances first"
            }
            AllocationStrategy::Proportional => {
                "Distributes the payment proportionally to invoice balances"
            }
        }
    }

    fn best_for(self) -> &'static str {
        match self {
            AllocationStrategy::Fifo => "Standard accounts receivable management",
            AllocationStrategy::Lifo => "Keeping current billing periods settled",
            AllocationStrategy::OverdueFirst => "Collections and cash flow optimization",
            AllocationStrategy::LargestFirst => "Reducing exposure on large receivables",
            AllocationStrategy::SmallestFirst => "Reducing the number of outstanding invoices",
            AllocationStrategy::Proportional => "Fair distribution across multiple invoices",
        }
    }

    /// Every supported strategy with its user-facing description.
    pub fn catalogue() -> Vec<StrategyInfo> {
        Self::ALL
            .iter()
            .map(|&strategy| StrategyInfo {
                strategy,
                key: strategy.as_str(),
                name: strategy.display_name(),
                description: strategy.description(),
                best_for: strategy.best_for(),
            })
            .collect()
    }

    /// Plan how to spread `available` across `candidates`.
    ///
    /// Only open invoices with a positive balance are considered. Amounts at or
    /// below the allocation tolerance are skipped, and no invoice receives more
    /// than its balance due. The result is deterministic for a given set of
    /// candidates regardless of their input order.
    pub fn plan(
        self,
        available: Decimal,
        candidates: &[Invoice],
        as_of: DateTime<Utc>,
    ) -> Vec<PlannedAllocation> {
        if available <= Decimal::ZERO {
            return Vec::new();
        }

        let mut open: Vec<&Invoice> = candidates.iter().filter(|inv| inv.is_open()).collect();
        if open.is_empty() {
            return Vec::new();
        }

        match self {
            AllocationStrategy::Fifo => {
                open.sort_by(|a, b| by_age(a, b));
                plan_greedy(available, &open, |_| {
                    "FIFO allocation - oldest invoice paid first".to_string()
                })
            }
            AllocationStrategy::Lifo => {
                open.sort_by(|a, b| {
                    b.created_at()
                        .cmp(&a.created_at())
                        .then_with(|| a.id_typed().cmp(&b.id_typed()))
                });
                plan_greedy(available, &open, |_| {
                    "LIFO allocation - newest invoice paid first".to_string()
                })
            }
            AllocationStrategy::OverdueFirst => {
                open.sort_by(|a, b| {
                    b.is_overdue(as_of)
                        .cmp(&a.is_overdue(as_of))
                        .then_with(|| a.due_date().cmp(&b.due_date()))
                        .then_with(|| by_age(a, b))
                });
                plan_greedy(available, &open, |inv| {
                    if inv.is_overdue(as_of) {
                        "Priority allocation - overdue invoice paid first".to_string()
                    } else {
                        "Priority allocation - non-overdue invoice".to_string()
                    }
                })
            }
            AllocationStrategy::LargestFirst => {
                open.sort_by(|a, b| {
                    b.balance_due()
                        .cmp(&a.balance_due())
                        .then_with(|| by_age(a, b))
                });
                plan_greedy(available, &open, |_| {
                    "Amount-based allocation - largest balance paid first".to_string()
                })
            }
            AllocationStrategy::SmallestFirst => {
                open.sort_by(|a, b| {
                    a.balance_due()
                        .cmp(&b.balance_due())
                        .then_with(|| by_age(a, b))
                });
                plan_greedy(available, &open, |_| {
                    "Amount-based allocation - smallest balance paid first".to_string()
                })
            }
            AllocationStrategy::Proportional => {
                open.sort_by(|a, b| by_age(a, b));
                plan_proportional(available, &open)
            }
        }
    }
}

impl core::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for AllocationStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| DomainError::unknown_strategy(s))
    }
}

/// Creation time, then id.
fn by_age(a: &Invoice, b: &Invoice) -> Ordering {
    a.created_at()
        .cmp(&b.created_at())
        .then_with(|| a.id_typed().cmp(&b.id_typed()))
}

fn plan_greedy<F>(available: Decimal, ordered: &[&Invoice], notes: F) -> Vec<PlannedAllocation>
where
    F: Fn(&Invoice) -> String,
{
    let mut plan = Vec::new();
    let mut unplanned = available;

    for invoice in ordered {
        if money::is_negligible(unplanned) {
            break;
        }

        let amount = invoice.balance_due().min(unplanned);
        if money::is_negligible(amount) {
            continue;
        }

        plan.push(PlannedAllocation {
            invoice_id: invoice.id_typed(),
            amount,
            notes: notes(*invoice),
        });
        unplanned -= amount;
    }

    plan
}

/// Falls back to an empty plan if any intermediate amount overflows `Decimal`.
fn plan_proportional(available: Decimal, ordered: &[&Invoice]) -> Vec<PlannedAllocation> {
    let Some(total_balance) = ordered
        .iter()
        .try_fold(Decimal::ZERO, |sum, inv| sum.checked_add(inv.balance_due()))
    else {
        tracing::warn!(invoices = ordered.len(), "proportional balance total overflowed");
        return Vec::new();
    };
    if total_balance <= Decimal::ZERO {
        return Vec::new();
    }

    let mut plan = Vec::new();
    let mut unplanned = available;

    for invoice in ordered {
        if money::is_negligible(unplanned) {
            break;
        }

        let Some(raw_share) = invoice
            .balance_due()
            .checked_mul(available)
            .and_then(|scaled| scaled.checked_div(total_balance))
        else {
            tracing::warn!(invoice_id = %invoice.id_typed(), "proportional share overflowed");
            return Vec::new();
        };
        let share = money::round_money(raw_share);
        let amount = share.min(invoice.balance_due()).min(unplanned);
        if money::is_negligible(amount) {
            continue;
        }

        plan.push(PlannedAllocation {
            invoice_id: invoice.id_typed(),
            amount,
            notes: "Proportional allocation - distributed by balance ratio".to_string(),
        });
        unplanned -= amount;
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use payalloc_core::{CompanyId, CustomerId};
    use payalloc_invoicing::{InvoiceParts, InvoiceStatus};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn invoice(balance: Decimal, age_days: i64, due: NaiveDate) -> Invoice {
        Invoice::from_parts(InvoiceParts {
            id: InvoiceId::new(),
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            invoice_number: format!("INV-{age_days}"),
            total_amount: balance,
            paid_amount: Decimal::ZERO,
            status: InvoiceStatus::Pending,
            due_date: due,
            created_at: base_time() + Duration::days(age_days),
            version: 1,
        })
        .unwrap()
    }

    fn due(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn amounts(plan: &[PlannedAllocation]) -> Vec<(InvoiceId, Decimal)> {
        plan.iter().map(|p| (p.invoice_id, p.amount)).collect()
    }

    #[test]
    fn fifo_pays_oldest_first_and_leaves_partial_on_newer() {
        let a = invoice(dec!(100), 0, due(2, 1));
        let b = invoice(dec!(50), 1, due(2, 1));

        let plan = AllocationStrategy::Fifo.plan(dec!(120), &[b.clone(), a.clone()], base_time());

        assert_eq!(
            amounts(&plan),
            vec![(a.id_typed(), dec!(100)), (b.id_typed(), dec!(20))]
        );
    }

    #[test]
    fn lifo_pays_newest_first() {
        let a = invoice(dec!(100), 0, due(2, 1));
        let b = invoice(dec!(50), 1, due(2, 1));

        let plan = AllocationStrategy::Lifo.plan(dec!(120), &[a.clone(), b.clone()], base_time());

        assert_eq!(
            amounts(&plan),
            vec![(b.id_typed(), dec!(50)), (a.id_typed(), dec!(70))]
        );
    }

    #[test]
    fn largest_first_covers_biggest_balance() {
        let a = invoice(dec!(80), 0, due(2, 1));
        let b = invoice(dec!(150), 1, due(2, 1));
        let c = invoice(dec!(40), 2, due(2, 1));

        let plan = AllocationStrategy::LargestFirst.plan(dec!(100), &[a, b.clone(), c], base_time());

        assert_eq!(amounts(&plan), vec![(b.id_typed(), dec!(100))]);
    }

    #[test]
    fn smallest_first_clears_small_invoices() {
        let a = invoice(dec!(80), 0, due(2, 1));
        let b = invoice(dec!(150), 1, due(2, 1));
        let c = invoice(dec!(40), 2, due(2, 1));

        let plan = AllocationStrategy::SmallestFirst.plan(
            dec!(100),
            &[a.clone(), b, c.clone()],
            base_time(),
        );

        assert_eq!(
            amounts(&plan),
            vec![(c.id_typed(), dec!(40)), (a.id_typed(), dec!(60))]
        );
    }

    #[test]
    fn overdue_first_puts_past_due_invoices_ahead() {
        let as_of = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let current = invoice(dec!(60), 0, due(4, 1));
        let late = invoice(dec!(30), 5, due(3, 10));
        let later = invoice(dec!(30), 6, due(2, 1));

        let plan = AllocationStrategy::OverdueFirst.plan(
            dec!(80),
            &[current.clone(), late.clone(), later.clone()],
            as_of,
        );

        assert_eq!(
            amounts(&plan),
            vec![
                (later.id_typed(), dec!(30)),
                (late.id_typed(), dec!(30)),
                (current.id_typed(), dec!(20)),
            ]
        );
        assert_eq!(plan[0].notes, "Priority allocation - overdue invoice paid first");
        assert_eq!(plan[2].notes, "Priority allocation - non-overdue invoice");
    }

    #[test]
    fn proportional_splits_by_balance_ratio() {
        let a = invoice(dec!(30), 0, due(2, 1));
        let b = invoice(dec!(70), 1, due(2, 1));

        let plan = AllocationStrategy::Proportional.plan(dec!(50), &[a.clone(), b.clone()], base_time());

        assert_eq!(
            amounts(&plan),
            vec![(a.id_typed(), dec!(15)), (b.id_typed(), dec!(35))]
        );
    }

    #[test]
    fn proportional_rounding_never_exceeds_available() {
        let a = invoice(dec!(10), 0, due(2, 1));
        let b = invoice(dec!(10), 1, due(2, 1));

        // Each share is 0.025 and rounds up to 0.03; the second is capped.
        let plan = AllocationStrategy::Proportional.plan(dec!(0.05), &[a.clone(), b.clone()], base_time());

        assert_eq!(
            amounts(&plan),
            vec![(a.id_typed(), dec!(0.03)), (b.id_typed(), dec!(0.02))]
        );
    }

    #[test]
    fn proportional_is_capped_by_balance_when_overpaid() {
        let a = invoice(dec!(30), 0, due(2, 1));
        let b = invoice(dec!(70), 1, due(2, 1));

        let plan = AllocationStrategy::Proportional.plan(dec!(500), &[a.clone(), b.clone()], base_time());

        assert_eq!(
            amounts(&plan),
            vec![(a.id_typed(), dec!(30)), (b.id_typed(), dec!(70))]
        );
    }

    #[test]
    fn empty_candidates_or_nothing_available_gives_empty_plan() {
        let a = invoice(dec!(30), 0, due(2, 1));

        for strategy in AllocationStrategy::ALL {
            assert!(strategy.plan(dec!(100), &[], base_time()).is_empty());
            assert!(strategy.plan(Decimal::ZERO, &[a.clone()], base_time()).is_empty());
            assert!(strategy.plan(dec!(0.01), &[a.clone()], base_time()).is_empty());
        }
    }

    #[test]
    fn closed_invoices_are_ignored() {
        let mut paid = invoice(dec!(30), 0, due(2, 1));
        paid.apply_amount(dec!(30)).unwrap();
        let open = invoice(dec!(20), 1, due(2, 1));

        let plan = AllocationStrategy::Fifo.plan(dec!(50), &[paid, open.clone()], base_time());

        assert_eq!(amounts(&plan), vec![(open.id_typed(), dec!(20))]);
    }

    #[test]
    fn draft_and_void_invoices_are_candidates() {
        let with_status = |balance, age, status| {
            let mut parts = invoice(balance, age, due(2, 1)).to_parts();
            parts.status = status;
            Invoice::from_parts(parts).unwrap()
        };
        let draft = with_status(dec!(30), 0, InvoiceStatus::Draft);
        let void = with_status(dec!(30), 1, InvoiceStatus::Void);
        let cancelled = with_status(dec!(30), 2, InvoiceStatus::Cancelled);

        let plan = AllocationStrategy::Fifo.plan(
            dec!(100),
            &[draft.clone(), void.clone(), cancelled],
            base_time(),
        );

        assert_eq!(
            amounts(&plan),
            vec![(draft.id_typed(), dec!(30)), (void.id_typed(), dec!(30))]
        );
    }

    #[test]
    fn proportional_overflow_gives_empty_plan() {
        let huge = invoice(Decimal::MAX, 0, due(2, 1));
        let also_huge = invoice(Decimal::MAX, 1, due(2, 1));

        let share_overflow =
            AllocationStrategy::Proportional.plan(Decimal::MAX, &[huge.clone()], base_time());
        assert!(share_overflow.is_empty());

        let total_overflow =
            AllocationStrategy::Proportional.plan(dec!(50), &[huge, also_huge], base_time());
        assert!(total_overflow.is_empty());
    }

    #[test]
    fn parses_every_catalogued_name() {
        let catalogue = AllocationStrategy::catalogue();
        assert_eq!(catalogue.len(), 6);

        for info in catalogue {
            assert_eq!(info.key.parse::<AllocationStrategy>().unwrap(), info.strategy);
        }

        let err = "percentage_based".parse::<AllocationStrategy>().unwrap_err();
        assert_eq!(err, DomainError::unknown_strategy("percentage_based"));
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&AllocationStrategy::OverdueFirst).unwrap();
        assert_eq!(json, "\"overdue_first\"");
    }

    fn candidates_strategy() -> impl Strategy<Value = Vec<Invoice>> {
        proptest::collection::vec((100i64..500_000, 0i64..60, 0u32..90), 0..12).prop_map(|rows| {
            rows
                .into_iter()
                .map(|(cents, age, due_offset)| {
                    invoice(
                        Decimal::new(cents, 2),
                        age,
                        due(1, 1) + Duration::days(i64::from(due_offset)),
                    )
                })
                .collect()
        })
    }

    fn strategy_strategy() -> impl Strategy<Value = AllocationStrategy> {
        proptest::sample::select(AllocationStrategy::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn plan_respects_available_and_balances(
            strategy in strategy_strategy(),
            available_cents in 0i64..2_000_000,
            candidates in candidates_strategy(),
        ) {
            let available = Decimal::new(available_cents, 2);
            let plan = strategy.plan(available, &candidates, base_time() + Duration::days(30));

            let total: Decimal = plan.iter().map(|p| p.amount).sum();
            prop_assert!(total <= available);

            let mut seen = std::collections::HashSet::new();
            for line in &plan {
                prop_assert!(seen.insert(line.invoice_id));
                prop_assert!(line.amount > money::ALLOCATION_TOLERANCE);

                let invoice = candidates
                    .iter()
                    .find(|inv| inv.id_typed() == line.invoice_id)
                    .unwrap();
                prop_assert!(line.amount <= invoice.balance_due());
            }
        }

        #[test]
        fn greedy_plans_distribute_everything_they_can(
            strategy in proptest::sample::select(vec![
                AllocationStrategy::Fifo,
                AllocationStrategy::Lifo,
                AllocationStrategy::OverdueFirst,
                AllocationStrategy::LargestFirst,
                AllocationStrategy::SmallestFirst,
            ]),
            available_cents in 0i64..2_000_000,
            candidates in candidates_strategy(),
        ) {
            let available = Decimal::new(available_cents, 2);
            let open_balance: Decimal = candidates.iter().map(|inv| inv.balance_due()).sum();

            let plan = strategy.plan(available, &candidates, base_time());
            let total: Decimal = plan.iter().map(|p| p.amount).sum();

            prop_assert!(total >= available.min(open_balance) - money::ALLOCATION_TOLERANCE);
        }

        #[test]
        fn plan_does_not_depend_on_candidate_order(
            strategy in strategy_strategy(),
            available_cents in 0i64..2_000_000,
            candidates in candidates_strategy(),
        ) {
            let available = Decimal::new(available_cents, 2);
            let mut reversed = candidates.clone();
            reversed.reverse();

            prop_assert_eq!(
                strategy.plan(available, &candidates, base_time()),
                strategy.plan(available, &reversed, base_time())
            );
        }
    }
}
