//! Allocation policy: which balance funds an outflow.
//!
//! Pure functions over balances the caller has already locked. Capital is
//! consumed before surplus; SHU is touched under `Auto` only once capital
//! alone cannot cover the amount.

use crate::error::{CashbookError, CashbookResult};
use crate::types::{Allocation, BalanceSheet, Destination, FundingDirective};
use rust_decimal::Decimal;

/// Decide the CAPITAL/SHU split for an expense of `amount`.
pub fn decide(
    amount: Decimal,
    directive: FundingDirective,
    locked: &BalanceSheet,
) -> CashbookResult<Allocation> {
    let capital = locked.capital;
    let shu = locked.shu;

    match directive {
        FundingDirective::Capital => {
            if capital >= amount {
                Ok(Allocation::capital(amount))
            } else {
                Err(CashbookError::insufficient(amount, capital, directive))
            }
        }
        FundingDirective::Shu => {
            if shu >= amount {
                Ok(Allocation::shu(amount))
            } else {
                Err(CashbookError::insufficient(amount, shu, directive))
            }
        }
        FundingDirective::Auto => {
            if capital >= amount {
                Ok(Allocation::capital(amount))
            } else if capital + shu >= amount {
                Ok(Allocation {
                    shu: amount - capital,
                    capital,
                })
            } else {
                Err(CashbookError::insufficient(amount, capital + shu, directive))
            }
        }
    }
}

/// Split for an income; inflows only ever raise balances.
pub fn inflow(amount: Decimal, destination: Destination) -> Allocation {
    match destination {
        Destination::Capital => Allocation::capital(amount),
        Destination::Shu => Allocation::shu(amount),
    }
}

/// Check that undoing a past inflow would not drive CAPITAL or SHU negative.
pub fn ensure_reversible(allocation: &Allocation, locked: &BalanceSheet) -> CashbookResult<()> {
    if allocation.capital > locked.capital {
        return Err(CashbookError::insufficient(
            allocation.capital,
            locked.capital,
            FundingDirective::Capital,
        ));
    }
    if allocation.shu > locked.shu {
        return Err(CashbookError::insufficient(
            allocation.shu,
            locked.shu,
            FundingDirective::Shu,
        ));
    }
    Ok(())
}
