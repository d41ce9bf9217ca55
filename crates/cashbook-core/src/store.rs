use crate::error::CashbookResult;
use crate::types::{
    Balance, BalanceSheet, BalanceType, EntryFilter, LedgerEntry, LedgerEntryDraft,
    OpeningBalances, SourceRef,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;

/// One atomic unit of cashbook work.
///
/// A unit holds exclusive locks on the balance rows it has read through
/// [`UnitOfWork::lock_and_read`]. Deltas and appended entries stay private to
/// the unit until [`UnitOfWork::commit`]. Dropping a unit without committing
/// discards everything it staged and releases its locks.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock the requested rows in canonical order and return their current
    /// values. May be called once per unit; waits at most `timeout`.
    async fn lock_and_read(
        &mut self,
        types: &[BalanceType],
        timeout: Duration,
    ) -> CashbookResult<BTreeMap<BalanceType, Balance>>;

    /// Add a signed delta to a row this unit has locked.
    async fn apply_delta(
        &mut self,
        balance_type: BalanceType,
        delta: Decimal,
    ) -> CashbookResult<Balance>;

    /// Entries recorded for one source, committed and staged, ascending.
    async fn entries_for_source(&mut self, source: &SourceRef)
        -> CashbookResult<Vec<LedgerEntry>>;

    /// Validate and stage an entry. Requires all three rows locked.
    async fn append(&mut self, draft: LedgerEntryDraft) -> CashbookResult<LedgerEntry>;

    /// Publish staged deltas and entries atomically and release locks.
    async fn commit(self: Box<Self>) -> CashbookResult<()>;

    /// Discard staged work and release locks.
    async fn rollback(self: Box<Self>) -> CashbookResult<()>;
}

/// Backend holding the balance rows and the ledger.
#[async_trait]
pub trait CashbookStore: Send + Sync {
    /// Short label for logs.
    fn backend_label(&self) -> &'static str;

    /// Create the three balance rows. Fails with `AlreadyProvisioned` when
    /// they exist.
    async fn provision(&self, opening: OpeningBalances) -> CashbookResult<BalanceSheet>;

    /// Open a new unit of work.
    async fn begin(&self) -> CashbookResult<Box<dyn UnitOfWork>>;

    /// Committed balances, read consistently across the three rows.
    async fn balances(&self) -> CashbookResult<BalanceSheet>;

    /// Committed entries matching `filter`, newest first.
    async fn find_entries(&self, filter: &EntryFilter) -> CashbookResult<Vec<LedgerEntry>>;

    /// Number of committed entries matching `filter`, ignoring pagination.
    async fn count_entries(&self, filter: &EntryFilter) -> CashbookResult<u64>;

    /// Every committed entry in sequence order.
    async fn all_entries(&self) -> CashbookResult<Vec<LedgerEntry>>;
}
