//! Append-only ledger rules shared by every store backend.
//!
//! Stores call [`validate_draft`] and [`seal`] when appending, so entry
//! validation and hash chaining are identical in memory and in PostgreSQL.
//! The read side (live-entry resolution, summary, verification) is pure
//! aggregation over entries with no caching.

use crate::error::{CashbookError, CashbookResult};
use crate::types::{
    add_to_balance, rescaled, BalanceSheet, BalanceSnapshot, Direction, LedgerEntry,
    LedgerEntryDraft,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Reject malformed drafts. Returns the validated snapshots.
pub fn validate_draft(
    draft: &LedgerEntryDraft,
) -> CashbookResult<(BalanceSnapshot, BalanceSnapshot)> {
    if draft.shu_amount < Decimal::ZERO || draft.capital_amount < Decimal::ZERO {
        return Err(CashbookError::InvalidEntry(format!(
            "amounts must be non-negative (shu {}, capital {})",
            draft.shu_amount, draft.capital_amount
        )));
    }
    let moved_total = draft
        .shu_amount
        .checked_add(draft.capital_amount)
        .ok_or_else(|| {
            CashbookError::InvalidEntry(format!(
                "shu {} + capital {} overflows",
                draft.shu_amount, draft.capital_amount
            ))
        })?;
    if moved_total <= Decimal::ZERO {
        return Err(CashbookError::InvalidEntry(
            "shu_amount + capital_amount must be greater than zero".to_string(),
        ));
    }
    let before = draft
        .before
        .ok_or_else(|| CashbookError::InvalidEntry("missing before snapshot".to_string()))?;
    let after = draft
        .after
        .ok_or_else(|| CashbookError::InvalidEntry("missing after snapshot".to_string()))?;

    let sign = draft.direction.sign();
    let checks = [
        ("capital", before.capital, draft.capital_amount, after.capital),
        ("shu", before.shu, draft.shu_amount, after.shu),
        ("total", before.total, moved_total, after.total),
    ];
    for (label, was, moved, now) in checks {
        if add_to_balance(was, sign * moved).ok() != Some(now) {
            return Err(CashbookError::InvalidEntry(format!(
                "{label} snapshot does not add up: {was} {} {moved} != {now}",
                draft.direction
            )));
        }
    }

    Ok((before, after))
}

/// Turn a validated draft into the stored entry, linking it to `previous_hash`.
pub fn seal(
    draft: LedgerEntryDraft,
    sequence: u64,
    previous_hash: Option<String>,
    created_at: DateTime<Utc>,
) -> CashbookResult<LedgerEntry> {
    let (before, after) = validate_draft(&draft)?;
    let mut entry = LedgerEntry {
        entry_id: Uuid::new_v4(),
        sequence,
        direction: draft.direction,
        shu_amount: rescaled(draft.shu_amount),
        capital_amount: rescaled(draft.capital_amount),
        before: rescaled_snapshot(before),
        after: rescaled_snapshot(after),
        source: draft.source,
        user_ref: draft.user_ref,
        category_ref: draft.category_ref,
        reverses: draft.reverses,
        occurred_at: draft.occurred_at,
        created_at,
        previous_hash,
        entry_hash: String::new(),
    };
    entry.entry_hash = compute_entry_hash(&entry);
    Ok(entry)
}

fn rescaled_snapshot(snapshot: BalanceSnapshot) -> BalanceSnapshot {
    BalanceSnapshot {
        total: rescaled(snapshot.total),
        capital: rescaled(snapshot.capital),
        shu: rescaled(snapshot.shu),
    }
}

/// Hash of every entry field except the hash itself.
pub fn compute_entry_hash(entry: &LedgerEntry) -> String {
    let material = serde_json::json!({
        "entry_id": entry.entry_id,
        "sequence": entry.sequence,
        "direction": entry.direction,
        "shu_amount": entry.shu_amount,
        "capital_amount": entry.capital_amount,
        "before": entry.before,
        "after": entry.after,
        "source": entry.source,
        "user_ref": entry.user_ref,
        "category_ref": entry.category_ref,
        "reverses": entry.reverses,
        "occurred_at": entry.occurred_at,
        "created_at": entry.created_at,
        "previous_hash": entry.previous_hash,
    });

    blake3::hash(material.to_string().as_bytes())
        .to_hex()
        .to_string()
}

/// The entry whose effect is currently standing for one source: the latest
/// non-reversal entry that no later entry reverses.
pub fn live_entry(history: &[LedgerEntry]) -> Option<&LedgerEntry> {
    let reversed: HashSet<Uuid> = history.iter().filter_map(|entry| entry.reverses).collect();
    history
        .iter()
        .filter(|entry| !entry.is_reversal() && !reversed.contains(&entry.entry_id))
        .max_by_key(|entry| entry.sequence)
}

/// Aggregate flows over a set of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_income: Decimal,
    pub total_expense: Decimal,
    pub net_flow: Decimal,
    pub count: u64,
}

/// Sum income and expense. A reversal counts against the flow it undoes, so a
/// deleted expense lowers `total_expense` instead of raising `total_income`.
pub fn summarize<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for entry in entries {
        let amount = entry.amount();
        match (entry.direction, entry.is_reversal()) {
            (Direction::In, false) => summary.total_income += amount,
            (Direction::Out, false) => summary.total_expense += amount,
            (Direction::In, true) => summary.total_expense -= amount,
            (Direction::Out, true) => summary.total_income -= amount,
        }
        summary.count += 1;
    }
    summary.net_flow = summary.total_income - summary.total_expense;
    summary
}

/// Outcome of replaying the committed ledger against the live balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub entries_checked: usize,
    pub chain_intact: bool,
    pub balances: BalanceSheet,
    pub issues: Vec<String>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.chain_intact && self.issues.is_empty()
    }
}

/// Replay `entries` (ascending sequence) and check hashes, snapshot
/// continuity, per-entry arithmetic and both balance invariants.
pub fn verify_entries(entries: &[LedgerEntry], balances: &BalanceSheet) -> VerificationReport {
    let mut issues = Vec::new();
    let mut chain_intact = true;
    let mut previous: Option<&LedgerEntry> = None;

    for entry in entries {
        if entry.entry_hash != compute_entry_hash(entry) {
            chain_intact = false;
            issues.push(format!("entry {} hash mismatch", entry.sequence));
        }
        let expected_previous = previous.map(|p| p.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            chain_intact = false;
            issues.push(format!("entry {} is not linked to its predecessor", entry.sequence));
        }
        if let Some(previous) = previous {
            if entry.before != previous.after {
                issues.push(format!(
                    "entry {} before snapshot does not continue entry {}",
                    entry.sequence, previous.sequence
                ));
            }
        }
        if entry.before.moved(entry.direction, &entry.allocation()).ok() != Some(entry.after) {
            issues.push(format!("entry {} does not add up", entry.sequence));
        }
        for (label, snapshot) in [("before", &entry.before), ("after", &entry.after)] {
            if !snapshot.is_conserved() {
                issues.push(format!("entry {} {label}: total != capital + shu", entry.sequence));
            }
            if !snapshot.is_non_negative() {
                issues.push(format!("entry {} {label}: negative balance", entry.sequence));
            }
        }
        previous = Some(entry);
    }

    if let Some(last) = previous {
        if last.after != balances.snapshot() {
            issues.push(format!(
                "live balances differ from entry {} after snapshot",
                last.sequence
            ));
        }
    }
    if !balances.snapshot().is_conserved() {
        issues.push("live balances: total != capital + shu".to_string());
    }
    if !balances.snapshot().is_non_negative() {
        issues.push("live balances: negative balance".to_string());
    }

    VerificationReport {
        entries_checked: entries.len(),
        chain_intact,
        balances: balances.clone(),
        issues,
    }
}
