//! Cooperative cashbook core.
//!
//! This crate owns the three running balances of the cooperative (TOTAL,
//! CAPITAL and SHU), the append-only ledger of every money movement against
//! them, and the coordinator that decides which balance funds an expense.
//!
//! Design stance:
//! - Every mutation runs inside one unit of work: lock balances, decide the
//!   allocation, apply deltas, append the entry, commit. Nothing is visible
//!   until commit.
//! - Ledger entries are never edited. Corrections append a reversal entry and,
//!   for updates, a replacement entry.
//! - Amounts are exact decimals with four fractional digits.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod allocation;
pub mod categories;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod storage;
pub mod store;
pub mod types;

pub use allocation::{decide, ensure_reversible, inflow};
pub use categories::{CategoryCatalog, ExpenseCategory, IncomeCategory};
pub use engine::{CashbookEngine, CorrectionReceipt, EngineConfig, ExpenseRequest, IncomeRequest};
pub use error::{CashbookError, CashbookResult};
pub use ledger::{LedgerSummary, VerificationReport};
pub use memory::InMemoryCashbookStore;
pub use storage::{bootstrap_store, StorageConfig};
pub use store::{CashbookStore, UnitOfWork};
pub use types::{
    max_amount, max_balance, Allocation, Balance, BalanceSheet, BalanceSnapshot, BalanceType,
    Destination, Direction, EntryFilter, FundingDirective, LedgerEntry, LedgerEntryDraft,
    OpeningBalances, SourceKind, SourceRef,
};
