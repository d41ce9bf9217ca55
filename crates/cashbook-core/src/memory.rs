//! In-memory cashbook store.
//!
//! Each balance row sits behind its own async mutex, so a unit of work holds
//! real row locks for its whole lifetime, the same way `SELECT ... FOR UPDATE`
//! does in PostgreSQL. Ledger entries live in one shared vector that is only
//! extended at commit time. Nothing survives a process restart.

use crate::error::{CashbookError, CashbookResult};
use crate::ledger;
use crate::store::{CashbookStore, UnitOfWork};
use crate::types::{
    add_to_balance, now_micros, rescaled, Balance, BalanceSheet, BalanceType, EntryFilter,
    LedgerEntry, LedgerEntryDraft, OpeningBalances, SourceRef,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type RowHandle = Arc<Mutex<Balance>>;

/// In-memory cashbook adapter.
#[derive(Default)]
pub struct InMemoryCashbookStore {
    rows: RwLock<BTreeMap<BalanceType, RowHandle>>,
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
}

impl InMemoryCashbookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> CashbookResult<BTreeMap<BalanceType, RowHandle>> {
        let guard = self
            .rows
            .read()
            .map_err(|_| CashbookError::Storage("balance rows lock poisoned".to_string()))?;
        Ok(guard.clone())
    }
}

fn poisoned_entries() -> CashbookError {
    CashbookError::Storage("ledger entries lock poisoned".to_string())
}

#[async_trait]
impl CashbookStore for InMemoryCashbookStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn provision(&self, opening: OpeningBalances) -> CashbookResult<BalanceSheet> {
        let rows = opening.into_rows(now_micros())?;
        let mut guard = self
            .rows
            .write()
            .map_err(|_| CashbookError::Storage("balance rows lock poisoned".to_string()))?;
        if !guard.is_empty() {
            return Err(CashbookError::AlreadyProvisioned);
        }

        let mut provisioned = BTreeMap::new();
        for row in rows {
            provisioned.insert(row.balance_type, row.clone());
            guard.insert(row.balance_type, Arc::new(Mutex::new(row)));
        }
        BalanceSheet::from_rows(&provisioned)
    }

    async fn begin(&self) -> CashbookResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(InMemoryUnit {
            rows: self.handles()?,
            entries: Arc::clone(&self.entries),
            guards: BTreeMap::new(),
            staged: BTreeMap::new(),
            pending: Vec::new(),
        }))
    }

    async fn balances(&self) -> CashbookResult<BalanceSheet> {
        let handles = self.handles()?;
        let mut rows = BTreeMap::new();
        // Same canonical order as writers, so a reader never observes a torn
        // commit.
        let mut guards = Vec::with_capacity(handles.len());
        for (balance_type, handle) in &handles {
            let guard = handle.lock().await;
            rows.insert(*balance_type, guard.clone());
            guards.push(guard);
        }
        drop(guards);
        BalanceSheet::from_rows(&rows)
    }

    async fn find_entries(&self, filter: &EntryFilter) -> CashbookResult<Vec<LedgerEntry>> {
        let guard = self.entries.read().map_err(|_| poisoned_entries())?;
        let matching = guard
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .skip(filter.offset.unwrap_or(0));
        let out: Vec<LedgerEntry> = match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        };
        Ok(out)
    }

    async fn count_entries(&self, filter: &EntryFilter) -> CashbookResult<u64> {
        let guard = self.entries.read().map_err(|_| poisoned_entries())?;
        Ok(guard.iter().filter(|entry| filter.matches(entry)).count() as u64)
    }

    async fn all_entries(&self) -> CashbookResult<Vec<LedgerEntry>> {
        let guard = self.entries.read().map_err(|_| poisoned_entries())?;
        Ok(guard.clone())
    }
}

struct InMemoryUnit {
    rows: BTreeMap<BalanceType, RowHandle>,
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
    guards: BTreeMap<BalanceType, OwnedMutexGuard<Balance>>,
    staged: BTreeMap<BalanceType, Balance>,
    pending: Vec<LedgerEntry>,
}

impl InMemoryUnit {
    fn tail(&self) -> CashbookResult<(u64, Option<String>)> {
        if let Some(last) = self.pending.last() {
            return Ok((last.sequence, Some(last.entry_hash.clone())));
        }
        let guard = self.entries.read().map_err(|_| poisoned_entries())?;
        Ok(guard
            .last()
            .map(|last| (last.sequence, Some(last.entry_hash.clone())))
            .unwrap_or((0, None)))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn lock_and_read(
        &mut self,
        types: &[BalanceType],
        timeout: Duration,
    ) -> CashbookResult<BTreeMap<BalanceType, Balance>> {
        if !self.guards.is_empty() {
            return Err(CashbookError::InvariantViolation(
                "balances already locked by this unit".to_string(),
            ));
        }

        let mut wanted = types.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut handles = Vec::with_capacity(wanted.len());
        for balance_type in wanted {
            let handle = self
                .rows
                .get(&balance_type)
                .ok_or(CashbookError::BalanceNotFound(balance_type))?;
            handles.push((balance_type, Arc::clone(handle)));
        }

        let acquire = async move {
            let mut guards = BTreeMap::new();
            for (balance_type, handle) in handles {
                guards.insert(balance_type, handle.lock_owned().await);
            }
            guards
        };
        let guards = tokio::time::timeout(timeout, acquire)
            .await
            .map_err(|_| CashbookError::LockTimeout {
                waited_ms: timeout.as_millis() as u64,
            })?;

        let read: BTreeMap<BalanceType, Balance> = guards
            .iter()
            .map(|(balance_type, guard)| (*balance_type, (**guard).clone()))
            .collect();
        self.staged = read.clone();
        self.guards = guards;
        Ok(read)
    }

    async fn apply_delta(
        &mut self,
        balance_type: BalanceType,
        delta: Decimal,
    ) -> CashbookResult<Balance> {
        let row = self.staged.get_mut(&balance_type).ok_or_else(|| {
            CashbookError::InvariantViolation(format!(
                "balance '{balance_type}' is not locked by this unit"
            ))
        })?;
        row.amount = rescaled(add_to_balance(row.amount, delta)?);
        row.updated_at = now_micros();
        Ok(row.clone())
    }

    async fn entries_for_source(
        &mut self,
        source: &SourceRef,
    ) -> CashbookResult<Vec<LedgerEntry>> {
        let mut history: Vec<LedgerEntry> = {
            let guard = self.entries.read().map_err(|_| poisoned_entries())?;
            guard
                .iter()
                .filter(|entry| &entry.source == source)
                .cloned()
                .collect()
        };
        history.extend(
            self.pending
                .iter()
                .filter(|entry| &entry.source == source)
                .cloned(),
        );
        Ok(history)
    }

    async fn append(&mut self, draft: LedgerEntryDraft) -> CashbookResult<LedgerEntry> {
        if let Some(missing) = BalanceType::ALL
            .iter()
            .find(|balance_type| !self.guards.contains_key(balance_type))
        {
            return Err(CashbookError::InvariantViolation(format!(
                "append requires every balance locked; '{missing}' is not"
            )));
        }

        let (sequence, previous_hash) = self.tail()?;
        let entry = ledger::seal(draft, sequence + 1, previous_hash, now_micros())?;
        self.pending.push(entry.clone());
        Ok(entry)
    }

    async fn commit(self: Box<Self>) -> CashbookResult<()> {
        let InMemoryUnit {
            entries,
            mut guards,
            staged,
            pending,
            ..
        } = *self;

        if staged.len() == BalanceType::ALL.len() {
            BalanceSheet::from_rows(&staged)?
                .snapshot()
                .check_committable()?;
        } else if staged.values().any(|row| row.amount < Decimal::ZERO) {
            return Err(CashbookError::InvariantViolation(
                "negative balance staged".to_string(),
            ));
        }

        let mut ledger = entries.write().map_err(|_| poisoned_entries())?;
        for (balance_type, row) in staged {
            if let Some(guard) = guards.get_mut(&balance_type) {
                **guard = row;
            }
        }
        ledger.extend(pending);
        drop(ledger);
        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CashbookResult<()> {
        Ok(())
    }
}
