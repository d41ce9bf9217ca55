//! Ledger transaction coordinator.
//!
//! Every mutating call runs one unit of work:
//! Begin -> Lock -> Decide/Reverse -> Apply -> Append -> Commit.
//! Any failure before commit rolls the unit back, so callers only ever see
//! a committed result or an error with no effect.

use crate::allocation::{decide, ensure_reversible, inflow};
use crate::categories::CategoryCatalog;
use crate::error::{CashbookError, CashbookResult};
use crate::ledger::{self, LedgerSummary, VerificationReport};
use crate::storage::{bootstrap_store, StorageConfig};
use crate::store::{CashbookStore, UnitOfWork};
use crate::types::{
    normalize_amount, now_micros, Allocation, BalanceSheet, BalanceSnapshot, BalanceType,
    Destination, Direction, EntryFilter, FundingDirective, LedgerEntry, LedgerEntryDraft,
    OpeningBalances, SourceRef,
};
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default bound on lock waits; requests may override it.
    pub lock_timeout: Duration,
    pub categories: CategoryCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            categories: CategoryCatalog::default(),
        }
    }
}

/// Money coming in, routed to one balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomeRequest {
    pub source_id: String,
    pub amount: Decimal,
    pub destination: Destination,
    pub user_ref: Option<String>,
    pub category_ref: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub lock_timeout: Option<Duration>,
}

impl IncomeRequest {
    pub fn new(amount: Decimal, destination: Destination, source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            amount,
            destination,
            user_ref: None,
            category_ref: None,
            occurred_at: None,
            lock_timeout: None,
        }
    }

    pub fn with_user(mut self, user_ref: impl Into<String>) -> Self {
        self.user_ref = Some(user_ref.into());
        self
    }

    pub fn with_category(mut self, category_ref: impl Into<String>) -> Self {
        self.category_ref = Some(category_ref.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Money going out, funded per `directive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpenseRequest {
    pub source_id: String,
    pub amount: Decimal,
    pub directive: FundingDirective,
    pub user_ref: Option<String>,
    pub category_ref: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub lock_timeout: Option<Duration>,
}

impl ExpenseRequest {
    pub fn new(
        amount: Decimal,
        directive: FundingDirective,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            amount,
            directive,
            user_ref: None,
            category_ref: None,
            occurred_at: None,
            lock_timeout: None,
        }
    }

    pub fn with_user(mut self, user_ref: impl Into<String>) -> Self {
        self.user_ref = Some(user_ref.into());
        self
    }

    pub fn with_category(mut self, category_ref: impl Into<String>) -> Self {
        self.category_ref = Some(category_ref.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Entries written by an update: the reversal of the old effect and the
/// entry carrying the new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionReceipt {
    pub reversal: LedgerEntry,
    pub replacement: LedgerEntry,
}

struct EntryMeta {
    source: SourceRef,
    user_ref: Option<String>,
    category_ref: Option<String>,
    reverses: Option<uuid::Uuid>,
    occurred_at: DateTime<Utc>,
}

/// Cashbook engine over a pluggable store.
pub struct CashbookEngine {
    store: Arc<dyn CashbookStore>,
    config: EngineConfig,
}

impl CashbookEngine {
    pub fn new(store: Arc<dyn CashbookStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Open the configured backend and wrap it.
    pub async fn bootstrap(storage: StorageConfig, config: EngineConfig) -> CashbookResult<Self> {
        let label = storage.label();
        let store = bootstrap_store(storage).await?;
        info!(backend = label, "Cashbook engine ready");
        Ok(Self::new(store, config))
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn categories(&self) -> &CategoryCatalog {
        &self.config.categories
    }

    /// Destination for an income in `category`, unless `explicit` is given.
    pub fn resolve_destination(
        &self,
        category: &str,
        explicit: Option<Destination>,
    ) -> CashbookResult<Destination> {
        self.config.categories.income_destination(category, explicit)
    }

    /// Funding directive for an expense in `category`, unless `explicit` is given.
    pub fn resolve_directive(
        &self,
        category: &str,
        explicit: Option<FundingDirective>,
    ) -> CashbookResult<FundingDirective> {
        self.config.categories.expense_directive(category, explicit)
    }

    /// Create the three balance rows. One-shot.
    pub async fn provision(&self, opening: OpeningBalances) -> CashbookResult<BalanceSheet> {
        let sheet = self.store.provision(opening).await?;
        info!(
            total = %sheet.total,
            capital = %sheet.capital,
            shu = %sheet.shu,
            "Balances provisioned"
        );
        Ok(sheet)
    }

    pub async fn record_income(&self, request: IncomeRequest) -> CashbookResult<LedgerEntry> {
        let amount = normalize_amount(request.amount)?;
        let source = SourceRef::income(request.source_id.clone());
        let mut unit = self.store.begin().await?;
        let outcome = self
            .income_in(unit.as_mut(), &request, amount, source.clone())
            .await;
        let entry = self.finish(unit, outcome, "record_income", &source).await?;
        info!(
            source = %entry.source,
            destination = %request.destination,
            amount = %amount,
            sequence = entry.sequence,
            "Income recorded"
        );
        Ok(entry)
    }

    pub async fn record_expense(&self, request: ExpenseRequest) -> CashbookResult<LedgerEntry> {
        let amount = normalize_amount(request.amount)?;
        let source = SourceRef::expense(request.source_id.clone());
        let mut unit = self.store.begin().await?;
        let outcome = self
            .expense_in(unit.as_mut(), &request, amount, source.clone())
            .await;
        let entry = self.finish(unit, outcome, "record_expense", &source).await?;
        info!(
            source = %entry.source,
            directive = %request.directive,
            capital = %entry.capital_amount,
            shu = %entry.shu_amount,
            sequence = entry.sequence,
            "Expense recorded"
        );
        Ok(entry)
    }

    /// Replace the live entry of an expense with a new amount and directive.
    /// Unset attribution fields carry over from the entry being replaced.
    pub async fn update_expense(
        &self,
        request: ExpenseRequest,
    ) -> CashbookResult<CorrectionReceipt> {
        let amount = normalize_amount(request.amount)?;
        let source = SourceRef::expense(request.source_id.clone());
        let mut unit = self.store.begin().await?;
        let outcome = self
            .update_expense_in(unit.as_mut(), &request, amount, source.clone())
            .await;
        let receipt = self.finish(unit, outcome, "update_expense", &source).await?;
        info!(
            source = %source,
            reversed = %receipt.reversal.amount(),
            capital = %receipt.replacement.capital_amount,
            shu = %receipt.replacement.shu_amount,
            "Expense updated"
        );
        Ok(receipt)
    }

    /// Reverse the live entry of an expense.
    pub async fn delete_expense(
        &self,
        source_id: &str,
        lock_timeout: Option<Duration>,
    ) -> CashbookResult<LedgerEntry> {
        self.delete(SourceRef::expense(source_id), lock_timeout, "delete_expense")
            .await
    }

    /// Replace the live entry of an income with a new amount and destination.
    pub async fn update_income(&self, request: IncomeRequest) -> CashbookResult<CorrectionReceipt> {
        let amount = normalize_amount(request.amount)?;
        let source = SourceRef::income(request.source_id.clone());
        let mut unit = self.store.begin().await?;
        let outcome = self
            .update_income_in(unit.as_mut(), &request, amount, source.clone())
            .await;
        let receipt = self.finish(unit, outcome, "update_income", &source).await?;
        info!(
            source = %source,
            reversed = %receipt.reversal.amount(),
            destination = %request.destination,
            amount = %amount,
            "Income updated"
        );
        Ok(receipt)
    }

    /// Reverse the live entry of an income. Refused when the receiving
    /// balance no longer holds the amount.
    pub async fn delete_income(
        &self,
        source_id: &str,
        lock_timeout: Option<Duration>,
    ) -> CashbookResult<LedgerEntry> {
        self.delete(SourceRef::income(source_id), lock_timeout, "delete_income")
            .await
    }

    /// Committed balances; takes no write locks.
    pub async fn get_balances(&self) -> CashbookResult<BalanceSheet> {
        self.store.balances().await
    }

    /// Aggregate flows over every entry matching `filter`; pagination is
    /// ignored.
    pub async fn get_summary(&self, filter: &EntryFilter) -> CashbookResult<LedgerSummary> {
        let entries = self.store.find_entries(&filter.unpaged()).await?;
        Ok(ledger::summarize(&entries))
    }

    pub async fn find_entries(&self, filter: &EntryFilter) -> CashbookResult<Vec<LedgerEntry>> {
        self.store.find_entries(filter).await
    }

    pub async fn count_entries(&self, filter: &EntryFilter) -> CashbookResult<u64> {
        self.store.count_entries(filter).await
    }

    pub async fn list_recent(&self, limit: usize) -> CashbookResult<Vec<LedgerEntry>> {
        self.store.find_entries(&EntryFilter::recent(limit)).await
    }

    /// Replay the whole ledger against the live balances. Holds every
    /// balance lock while reading so no commit can interleave.
    pub async fn verify(&self) -> CashbookResult<VerificationReport> {
        let mut unit = self.store.begin().await?;
        let rows = match unit
            .lock_and_read(&BalanceType::ALL, self.config.lock_timeout)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(operation = "verify", error = %rollback_err, "Rollback failed");
                }
                return Err(err);
            }
        };
        let entries = self.store.all_entries().await;
        unit.rollback().await?;

        let sheet = BalanceSheet::from_rows(&rows)?;
        let report = ledger::verify_entries(&entries?, &sheet);
        if report.is_clean() {
            info!(entries = report.entries_checked, "Ledger verified");
        } else {
            warn!(
                entries = report.entries_checked,
                issues = report.issues.len(),
                chain_intact = report.chain_intact,
                "Ledger verification found issues"
            );
        }
        Ok(report)
    }

    async fn delete(
        &self,
        source: SourceRef,
        lock_timeout: Option<Duration>,
        operation: &'static str,
    ) -> CashbookResult<LedgerEntry> {
        let timeout = lock_timeout.unwrap_or(self.config.lock_timeout);
        let mut unit = self.store.begin().await?;
        let outcome = self.delete_in(unit.as_mut(), &source, timeout).await;
        let reversal = self.finish(unit, outcome, operation, &source).await?;
        info!(
            source = %source,
            reverses = ?reversal.reverses,
            amount = %reversal.amount(),
            "Entry reversed"
        );
        Ok(reversal)
    }

    async fn delete_in(
        &self,
        unit: &mut dyn UnitOfWork,
        source: &SourceRef,
        timeout: Duration,
    ) -> CashbookResult<LedgerEntry> {
        let (sheet, live) = self.lock_live(unit, source, timeout).await?;
        let (reversal, _) = self.reverse(unit, &sheet, &live).await?;
        Ok(reversal)
    }

    async fn income_in(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &IncomeRequest,
        amount: Decimal,
        source: SourceRef,
    ) -> CashbookResult<LedgerEntry> {
        let timeout = request.lock_timeout.unwrap_or(self.config.lock_timeout);
        let sheet = self.lock_all(unit, timeout).await?;
        self.ensure_new_source(unit, &source).await?;

        let allocation = inflow(amount, request.destination);
        let meta = EntryMeta {
            source,
            user_ref: request.user_ref.clone(),
            category_ref: request.category_ref.clone(),
            reverses: None,
            occurred_at: occurred(request.occurred_at),
        };
        self.post(unit, sheet.snapshot(), Direction::In, allocation, meta)
            .await
    }

    async fn expense_in(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &ExpenseRequest,
        amount: Decimal,
        source: SourceRef,
    ) -> CashbookResult<LedgerEntry> {
        let timeout = request.lock_timeout.unwrap_or(self.config.lock_timeout);
        let sheet = self.lock_all(unit, timeout).await?;
        self.ensure_new_source(unit, &source).await?;

        let allocation = decide(amount, request.directive, &sheet)?;
        debug!(
            source = %source,
            directive = %request.directive,
            capital = %allocation.capital,
            shu = %allocation.shu,
            "Allocation decided"
        );
        let meta = EntryMeta {
            source,
            user_ref: request.user_ref.clone(),
            category_ref: request.category_ref.clone(),
            reverses: None,
            occurred_at: occurred(request.occurred_at),
        };
        self.post(unit, sheet.snapshot(), Direction::Out, allocation, meta)
            .await
    }

    async fn update_expense_in(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &ExpenseRequest,
        amount: Decimal,
        source: SourceRef,
    ) -> CashbookResult<CorrectionReceipt> {
        let timeout = request.lock_timeout.unwrap_or(self.config.lock_timeout);
        let (sheet, live) = self.lock_live(unit, &source, timeout).await?;
        let (reversal, restored) = self.reverse(unit, &sheet, &live).await?;

        let restored_sheet = at_snapshot(&sheet, restored);
        let allocation = decide(amount, request.directive, &restored_sheet)?;
        debug!(
            source = %source,
            directive = %request.directive,
            capital = %allocation.capital,
            shu = %allocation.shu,
            "Allocation decided"
        );
        let meta = EntryMeta {
            source,
            user_ref: request.user_ref.clone().or_else(|| live.user_ref.clone()),
            category_ref: request
                .category_ref
                .clone()
                .or_else(|| live.category_ref.clone()),
            reverses: None,
            occurred_at: request
                .occurred_at
                .map(|at| at.trunc_subsecs(6))
                .unwrap_or(live.occurred_at),
        };
        let replacement = self
            .post(unit, restored, Direction::Out, allocation, meta)
            .await?;
        Ok(CorrectionReceipt {
            reversal,
            replacement,
        })
    }

    async fn update_income_in(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &IncomeRequest,
        amount: Decimal,
        source: SourceRef,
    ) -> CashbookResult<CorrectionReceipt> {
        let timeout = request.lock_timeout.unwrap_or(self.config.lock_timeout);
        let (sheet, live) = self.lock_live(unit, &source, timeout).await?;
        let (reversal, restored) = self.reverse(unit, &sheet, &live).await?;

        let meta = EntryMeta {
            source,
            user_ref: request.user_ref.clone().or_else(|| live.user_ref.clone()),
            category_ref: request
                .category_ref
                .clone()
                .or_else(|| live.category_ref.clone()),
            reverses: None,
            occurred_at: request
                .occurred_at
                .map(|at| at.trunc_subsecs(6))
                .unwrap_or(live.occurred_at),
        };
        let replacement = self
            .post(
                unit,
                restored,
                Direction::In,
                inflow(amount, request.destination),
                meta,
            )
            .await?;
        Ok(CorrectionReceipt {
            reversal,
            replacement,
        })
    }

    async fn lock_all(
        &self,
        unit: &mut dyn UnitOfWork,
        timeout: Duration,
    ) -> CashbookResult<BalanceSheet> {
        let rows = unit.lock_and_read(&BalanceType::ALL, timeout).await?;
        let sheet = BalanceSheet::from_rows(&rows)?;
        debug!(
            total = %sheet.total,
            capital = %sheet.capital,
            shu = %sheet.shu,
            "Balances locked"
        );
        Ok(sheet)
    }

    async fn lock_live(
        &self,
        unit: &mut dyn UnitOfWork,
        source: &SourceRef,
        timeout: Duration,
    ) -> CashbookResult<(BalanceSheet, LedgerEntry)> {
        let sheet = self.lock_all(unit, timeout).await?;
        let history = unit.entries_for_source(source).await?;
        let live = ledger::live_entry(&history)
            .cloned()
            .ok_or_else(|| CashbookError::SourceNotFound(source.clone()))?;
        Ok((sheet, live))
    }

    async fn ensure_new_source(
        &self,
        unit: &mut dyn UnitOfWork,
        source: &SourceRef,
    ) -> CashbookResult<()> {
        let history = unit.entries_for_source(source).await?;
        if ledger::live_entry(&history).is_some() {
            return Err(CashbookError::InvalidEntry(format!(
                "{source} already has a live entry"
            )));
        }
        Ok(())
    }

    /// Undo `live` against the locked state. Returns the reversal and the
    /// balances it leaves behind.
    async fn reverse(
        &self,
        unit: &mut dyn UnitOfWork,
        sheet: &BalanceSheet,
        live: &LedgerEntry,
    ) -> CashbookResult<(LedgerEntry, BalanceSnapshot)> {
        let allocation = live.allocation();
        if live.direction == Direction::In {
            ensure_reversible(&allocation, sheet)?;
        }
        let meta = EntryMeta {
            source: live.source.clone(),
            user_ref: live.user_ref.clone(),
            category_ref: live.category_ref.clone(),
            reverses: Some(live.entry_id),
            occurred_at: now_micros(),
        };
        let reversal = self
            .post(
                unit,
                sheet.snapshot(),
                live.direction.opposite(),
                allocation,
                meta,
            )
            .await?;
        let after = reversal.after;
        Ok((reversal, after))
    }

    /// Apply the movement and append its entry.
    async fn post(
        &self,
        unit: &mut dyn UnitOfWork,
        before: BalanceSnapshot,
        direction: Direction,
        allocation: Allocation,
        meta: EntryMeta,
    ) -> CashbookResult<LedgerEntry> {
        let after = before.moved(direction, &allocation)?;
        after.check_committable()?;

        let sign = direction.sign();
        if !allocation.capital.is_zero() {
            unit.apply_delta(BalanceType::Capital, sign * allocation.capital)
                .await?;
        }
        if !allocation.shu.is_zero() {
            unit.apply_delta(BalanceType::Shu, sign * allocation.shu)
                .await?;
        }
        unit.apply_delta(BalanceType::Total, after.total - before.total)
            .await?;

        unit.append(LedgerEntryDraft {
            direction,
            shu_amount: allocation.shu,
            capital_amount: allocation.capital,
            before: Some(before),
            after: Some(after),
            source: meta.source,
            user_ref: meta.user_ref,
            category_ref: meta.category_ref,
            reverses: meta.reverses,
            occurred_at: meta.occurred_at,
        })
        .await
    }

    async fn finish<T>(
        &self,
        unit: Box<dyn UnitOfWork>,
        outcome: CashbookResult<T>,
        operation: &'static str,
        source: &SourceRef,
    ) -> CashbookResult<T> {
        match outcome {
            Ok(value) => match unit.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    warn!(operation, source = %source, error = %err, "Commit failed");
                    Err(err)
                }
            },
            Err(err) => {
                if err.is_rejection() {
                    debug!(operation, source = %source, error = %err, "Request rejected");
                } else {
                    warn!(operation, source = %source, error = %err, "Unit aborted");
                }
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(operation, error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn occurred(at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    at.map(|at| at.trunc_subsecs(6)).unwrap_or_else(now_micros)
}

fn at_snapshot(sheet: &BalanceSheet, snapshot: BalanceSnapshot) -> BalanceSheet {
    BalanceSheet {
        total: snapshot.total,
        capital: snapshot.capital,
        shu: snapshot.shu,
        updated_at: sheet.updated_at,
    }
}
