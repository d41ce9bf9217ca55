use crate::error::{CashbookError, CashbookResult};
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fractional digits carried by every stored amount.
pub const AMOUNT_SCALE: u32 = 4;

/// Largest single amount accepted: 999,999,999,999.9999.
pub fn max_amount() -> Decimal {
    Decimal::new(9_999_999_999_999_999, AMOUNT_SCALE)
}

/// Validate a caller-supplied amount and rescale it to [`AMOUNT_SCALE`].
///
/// Amounts must be strictly positive, at most [`max_amount`], and carry no
/// more than four fractional digits. Nothing is rounded silently.
pub fn normalize_amount(amount: Decimal) -> CashbookResult<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(CashbookError::InvalidAmount(format!(
            "{amount} must be greater than zero"
        )));
    }
    if amount > max_amount() {
        return Err(CashbookError::InvalidAmount(format!(
            "{amount} exceeds maximum of {}",
            max_amount()
        )));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(CashbookError::InvalidAmount(format!(
            "{amount} has more than {AMOUNT_SCALE} fractional digits"
        )));
    }
    Ok(rescaled(amount))
}

/// Largest balance a row can hold (NUMERIC(20,4)): 9,999,999,999,999,999.9999.
pub fn max_balance() -> Decimal {
    Decimal::from_i128_with_scale(99_999_999_999_999_999_999, AMOUNT_SCALE)
}

/// Add a signed delta to a balance value, refusing overflow and anything a
/// balance row cannot hold.
pub(crate) fn add_to_balance(value: Decimal, delta: Decimal) -> CashbookResult<Decimal> {
    let next = value
        .checked_add(delta)
        .ok_or_else(|| CashbookError::InvalidAmount(format!("{value} + {delta} overflows")))?;
    if next.abs() > max_balance() {
        return Err(CashbookError::InvalidAmount(format!(
            "balance {next} exceeds maximum of {}",
            max_balance()
        )));
    }
    Ok(next)
}

pub(crate) fn rescaled(value: Decimal) -> Decimal {
    let mut value = value;
    value.rescale(AMOUNT_SCALE);
    value
}

/// Timestamps are kept at microsecond precision so they survive a round trip
/// through `TIMESTAMPTZ` unchanged.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The three balances tracked by the cashbook.
///
/// Declaration order is the canonical lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    Total,
    Capital,
    Shu,
}

impl BalanceType {
    pub const ALL: [BalanceType; 3] = [BalanceType::Total, BalanceType::Capital, BalanceType::Shu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Capital => "capital",
            Self::Shu => "shu",
        }
    }
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalanceType {
    type Err = CashbookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "total" => Ok(Self::Total),
            "capital" => Ok(Self::Capital),
            "shu" => Ok(Self::Shu),
            other => Err(CashbookError::InvalidEntry(format!(
                "unknown balance type '{other}'"
            ))),
        }
    }
}

/// One balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub balance_type: BalanceType,
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Values of all three balances at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub total: Decimal,
    pub capital: Decimal,
    pub shu: Decimal,
}

impl BalanceSnapshot {
    pub fn get(&self, balance_type: BalanceType) -> Decimal {
        match balance_type {
            BalanceType::Total => self.total,
            BalanceType::Capital => self.capital,
            BalanceType::Shu => self.shu,
        }
    }

    /// TOTAL == CAPITAL + SHU.
    pub fn is_conserved(&self) -> bool {
        self.capital.checked_add(self.shu) == Some(self.total)
    }

    /// CAPITAL >= 0 and SHU >= 0.
    pub fn is_non_negative(&self) -> bool {
        self.capital >= Decimal::ZERO && self.shu >= Decimal::ZERO
    }

    pub(crate) fn check_committable(&self) -> CashbookResult<()> {
        if !self.is_conserved() {
            return Err(CashbookError::InvariantViolation(format!(
                "total {} != capital {} + shu {}",
                self.total, self.capital, self.shu
            )));
        }
        if !self.is_non_negative() {
            return Err(CashbookError::InvariantViolation(format!(
                "negative balance: capital {}, shu {}",
                self.capital, self.shu
            )));
        }
        Ok(())
    }

    /// Apply a signed movement of `allocation` in `direction`.
    pub fn moved(&self, direction: Direction, allocation: &Allocation) -> CashbookResult<Self> {
        let sign = direction.sign();
        let moved_total = allocation
            .capital
            .checked_add(allocation.shu)
            .ok_or_else(|| {
                CashbookError::InvalidAmount(format!(
                    "allocation capital {} + shu {} overflows",
                    allocation.capital, allocation.shu
                ))
            })?;
        Ok(Self {
            total: add_to_balance(self.total, sign * moved_total)?,
            capital: add_to_balance(self.capital, sign * allocation.capital)?,
            shu: add_to_balance(self.shu, sign * allocation.shu)?,
        })
    }
}

/// Balance sheet returned to query collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub total: Decimal,
    pub capital: Decimal,
    pub shu: Decimal,
    /// Most recent mutation across the three rows.
    pub updated_at: DateTime<Utc>,
}

impl BalanceSheet {
    /// Assemble a sheet from locked or read rows; every type must be present.
    pub fn from_rows(rows: &BTreeMap<BalanceType, Balance>) -> CashbookResult<Self> {
        let row = |balance_type: BalanceType| {
            rows.get(&balance_type)
                .ok_or(CashbookError::BalanceNotFound(balance_type))
        };
        let total = row(BalanceType::Total)?;
        let capital = row(BalanceType::Capital)?;
        let shu = row(BalanceType::Shu)?;
        let updated_at = total
            .updated_at
            .max(capital.updated_at)
            .max(shu.updated_at);

        Ok(Self {
            total: total.amount,
            capital: capital.amount,
            shu: shu.amount,
            updated_at,
        })
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            total: self.total,
            capital: self.capital,
            shu: self.shu,
        }
    }
}

/// Starting amounts supplied at system bring-up. TOTAL is derived so the
/// conservation invariant holds from the first committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningBalances {
    pub capital: Decimal,
    pub shu: Decimal,
}

impl OpeningBalances {
    pub fn new(capital: Decimal, shu: Decimal) -> Self {
        Self { capital, shu }
    }

    /// Validate and produce the three provisioned rows.
    pub fn into_rows(self, at: DateTime<Utc>) -> CashbookResult<Vec<Balance>> {
        for (label, value) in [("capital", self.capital), ("shu", self.shu)] {
            if value < Decimal::ZERO {
                return Err(CashbookError::InvalidAmount(format!(
                    "opening {label} balance {value} is negative"
                )));
            }
            if value.normalize().scale() > AMOUNT_SCALE {
                return Err(CashbookError::InvalidAmount(format!(
                    "opening {label} balance {value} has more than {AMOUNT_SCALE} fractional digits"
                )));
            }
        }
        let capital = rescaled(add_to_balance(Decimal::ZERO, self.capital)?);
        let shu = rescaled(add_to_balance(Decimal::ZERO, self.shu)?);
        let total = add_to_balance(capital, shu)?;
        Ok(vec![
            Balance {
                balance_type: BalanceType::Total,
                amount: total,
                updated_at: at,
            },
            Balance {
                balance_type: BalanceType::Capital,
                amount: capital,
                updated_at: at,
            },
            Balance {
                balance_type: BalanceType::Shu,
                amount: shu,
                updated_at: at,
            },
        ])
    }
}

/// Direction of a money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Self::In => Decimal::ONE,
            Self::Out => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = CashbookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "in" | "income" => Ok(Self::In),
            "out" | "expense" => Ok(Self::Out),
            other => Err(CashbookError::InvalidEntry(format!(
                "direction must be 'in' or 'out', got '{other}'"
            ))),
        }
    }
}

/// Funding source requested for an expense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingDirective {
    Capital,
    Shu,
    /// Capital first, then SHU for the remainder.
    Auto,
}

impl FundingDirective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capital => "capital",
            Self::Shu => "shu",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for FundingDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FundingDirective {
    type Err = CashbookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "capital" => Ok(Self::Capital),
            "shu" => Ok(Self::Shu),
            "auto" => Ok(Self::Auto),
            other => Err(CashbookError::InvalidEntry(format!(
                "funding directive must be capital, shu or auto, got '{other}'"
            ))),
        }
    }
}

/// Target balance for an income.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Capital,
    Shu,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capital => "capital",
            Self::Shu => "shu",
        }
    }

    pub fn balance_type(&self) -> BalanceType {
        match self {
            Self::Capital => BalanceType::Capital,
            Self::Shu => BalanceType::Shu,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = CashbookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "capital" => Ok(Self::Capital),
            "shu" => Ok(Self::Shu),
            other => Err(CashbookError::InvalidEntry(format!(
                "destination must be capital or shu, got '{other}'"
            ))),
        }
    }
}

/// Kind of record that originated a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Income,
    Expense,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

impl FromStr for SourceKind {
    type Err = CashbookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(CashbookError::InvalidEntry(format!(
                "unknown source kind '{other}'"
            ))),
        }
    }
}

/// Opaque reference to the income or expense record behind an entry.
/// The ledger stores it for traceability and never dereferences it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub id: String,
}

impl SourceRef {
    pub fn income(id: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Income,
            id: id.into(),
        }
    }

    pub fn expense(id: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Expense,
            id: id.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Split of one movement between CAPITAL and SHU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub shu: Decimal,
    pub capital: Decimal,
}

impl Allocation {
    pub fn capital(amount: Decimal) -> Self {
        Self {
            shu: Decimal::ZERO,
            capital: amount,
        }
    }

    pub fn shu(amount: Decimal) -> Self {
        Self {
            shu: amount,
            capital: Decimal::ZERO,
        }
    }
}

/// Entry as handed to the ledger for appending. Sequence, hash and
/// `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryDraft {
    pub direction: Direction,
    pub shu_amount: Decimal,
    pub capital_amount: Decimal,
    pub before: Option<BalanceSnapshot>,
    pub after: Option<BalanceSnapshot>,
    pub source: SourceRef,
    pub user_ref: Option<String>,
    pub category_ref: Option<String>,
    /// Entry whose effect this one undoes.
    pub reverses: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

/// Immutable, hash-linked ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub sequence: u64,
    pub direction: Direction,
    pub shu_amount: Decimal,
    pub capital_amount: Decimal,
    pub before: BalanceSnapshot,
    pub after: BalanceSnapshot,
    pub source: SourceRef,
    pub user_ref: Option<String>,
    pub category_ref: Option<String>,
    pub reverses: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl LedgerEntry {
    pub fn amount(&self) -> Decimal {
        self.shu_amount + self.capital_amount
    }

    pub fn allocation(&self) -> Allocation {
        Allocation {
            shu: self.shu_amount,
            capital: self.capital_amount,
        }
    }

    pub fn is_reversal(&self) -> bool {
        self.reverses.is_some()
    }
}

/// Query filter over ledger entries. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    /// Inclusive lower bound on `occurred_at`.
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub date_to: Option<DateTime<Utc>>,
    pub direction: Option<Direction>,
    pub user_ref: Option<String>,
    pub category_ref: Option<String>,
    pub source: Option<SourceRef>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EntryFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn for_source(source: SourceRef) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn for_user(user_ref: impl Into<String>) -> Self {
        Self {
            user_ref: Some(user_ref.into()),
            ..Self::default()
        }
    }

    pub fn for_category(category_ref: impl Into<String>) -> Self {
        Self {
            category_ref: Some(category_ref.into()),
            ..Self::default()
        }
    }

    /// Same predicates, no pagination.
    pub fn unpaged(&self) -> Self {
        Self {
            limit: None,
            offset: None,
            ..self.clone()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(from) = self.date_from {
            if entry.occurred_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if entry.occurred_at > to {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if entry.direction != direction {
                return false;
            }
        }
        if let Some(user_ref) = &self.user_ref {
            if entry.user_ref.as_ref() != Some(user_ref) {
                return false;
            }
        }
        if let Some(category_ref) = &self.category_ref {
            if entry.category_ref.as_ref() != Some(category_ref) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &entry.source != source {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalize_amount_rescales_to_four_digits() {
        let amount = normalize_amount(dec!(2000000)).unwrap();
        assert_eq!(amount, dec!(2000000));
        assert_eq!(amount.scale(), AMOUNT_SCALE);
        assert_eq!(amount.to_string(), "2000000.0000");
    }

    #[test]
    fn normalize_amount_rejects_out_of_domain_values() {
        assert!(matches!(
            normalize_amount(Decimal::ZERO),
            Err(CashbookError::InvalidAmount(_))
        ));
        assert!(matches!(
            normalize_amount(dec!(-1)),
            Err(CashbookError::InvalidAmount(_))
        ));
        assert!(matches!(
            normalize_amount(dec!(1.00001)),
            Err(CashbookError::InvalidAmount(_))
        ));
        assert!(matches!(
            normalize_amount(dec!(1000000000000)),
            Err(CashbookError::InvalidAmount(_))
        ));
        assert!(normalize_amount(dec!(999999999999.9999)).is_ok());
        // Trailing zeros beyond the scale are not extra precision.
        assert_eq!(normalize_amount(dec!(1.500000)).unwrap(), dec!(1.5));
    }

    #[test]
    fn balance_type_order_is_lock_order() {
        let mut types = vec![BalanceType::Shu, BalanceType::Total, BalanceType::Capital];
        types.sort();
        assert_eq!(types, BalanceType::ALL.to_vec());
    }

    #[test]
    fn parse_labels() {
        assert_eq!("SHU".parse::<BalanceType>().unwrap(), BalanceType::Shu);
        assert_eq!("auto".parse::<FundingDirective>().unwrap(), FundingDirective::Auto);
        assert_eq!("capital".parse::<Destination>().unwrap(), Destination::Capital);
        assert_eq!("out".parse::<Direction>().unwrap(), Direction::Out);
        assert!("sideways".parse::<Direction>().is_err());
        assert!("auto".parse::<Destination>().is_err());
    }

    #[test]
    fn snapshot_moves_by_signed_allocation() {
        let before = BalanceSnapshot {
            total: dec!(4000000),
            capital: dec!(2000000),
            shu: dec!(2000000),
        };
        let allocation = Allocation {
            shu: dec!(1000000),
            capital: dec!(2000000),
        };
        let after = before.moved(Direction::Out, &allocation).unwrap();
        assert_eq!(after.capital, Decimal::ZERO);
        assert_eq!(after.shu, dec!(1000000));
        assert_eq!(after.total, dec!(1000000));
        assert!(after.is_conserved());
        assert_eq!(after.moved(Direction::In, &allocation).unwrap(), before);
    }

    #[test]
    fn opening_balances_derive_total() {
        let rows = OpeningBalances::new(dec!(5000000), Decimal::ZERO)
            .into_rows(now_micros())
            .unwrap();
        let map: BTreeMap<_, _> = rows.into_iter().map(|b| (b.balance_type, b)).collect();
        let sheet = BalanceSheet::from_rows(&map).unwrap();
        assert_eq!(sheet.total, dec!(5000000));
        assert!(sheet.snapshot().is_conserved());

        assert!(OpeningBalances::new(dec!(-1), Decimal::ZERO)
            .into_rows(now_micros())
            .is_err());
    }

    #[test]
    fn opening_balances_bounded_by_row_capacity() {
        for (capital, shu) in [
            (Decimal::MAX, Decimal::ZERO),
            (Decimal::MAX, Decimal::MAX),
            (max_balance(), dec!(0.0001)),
        ] {
            assert!(matches!(
                OpeningBalances::new(capital, shu).into_rows(now_micros()),
                Err(CashbookError::InvalidAmount(_))
            ));
        }
        let rows = OpeningBalances::new(max_balance(), Decimal::ZERO)
            .into_rows(now_micros())
            .unwrap();
        assert!(rows.iter().all(|row| row.amount.scale() == AMOUNT_SCALE));
    }

    #[test]
    fn moved_past_capacity_is_an_error() {
        let before = BalanceSnapshot {
            total: max_balance(),
            capital: max_balance(),
            shu: Decimal::ZERO,
        };
        assert!(matches!(
            before.moved(Direction::In, &Allocation::capital(dec!(1))),
            Err(CashbookError::InvalidAmount(_))
        ));
        let huge = Allocation {
            shu: Decimal::MAX,
            capital: Decimal::MAX,
        };
        assert!(before.moved(Direction::Out, &huge).is_err());
    }

    #[test]
    fn sheet_requires_every_row() {
        let mut rows = BTreeMap::new();
        rows.insert(
            BalanceType::Total,
            Balance {
                balance_type: BalanceType::Total,
                amount: Decimal::ZERO,
                updated_at: now_micros(),
            },
        );
        assert!(matches!(
            BalanceSheet::from_rows(&rows),
            Err(CashbookError::BalanceNotFound(BalanceType::Capital))
        ));
    }
}
