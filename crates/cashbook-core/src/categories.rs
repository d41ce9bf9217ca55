//! Income and expense categories with their default routing.
//!
//! A category only supplies a default: callers may always name an explicit
//! destination or funding directive, which wins.

use crate::error::{CashbookError, CashbookResult};
use crate::types::{Destination, FundingDirective};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeCategory {
    pub code: String,
    pub name: String,
    pub default_destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseCategory {
    pub code: String,
    pub name: String,
    pub default_directive: FundingDirective,
}

/// Category lookup keyed by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCatalog {
    income: BTreeMap<String, IncomeCategory>,
    expense: BTreeMap<String, ExpenseCategory>,
}

const INCOME_SEED: [(&str, &str, Destination); 8] = [
    ("principal_savings", "Principal Savings", Destination::Capital),
    ("mandatory_savings", "Mandatory Savings", Destination::Capital),
    ("installment_principal", "Installment Principal", Destination::Capital),
    ("loan_interest", "Loan Interest", Destination::Shu),
    ("loan_admin_fee", "Loan Admin Fee", Destination::Shu),
    ("late_payment_penalty", "Late Payment Penalty", Destination::Shu),
    ("donation", "Donation", Destination::Capital),
    ("others", "Others", Destination::Capital),
];

const EXPENSE_SEED: [(&str, &str, FundingDirective); 6] = [
    ("operational", "Operational", FundingDirective::Auto),
    ("administrative", "Administrative", FundingDirective::Auto),
    ("maintenance", "Maintenance", FundingDirective::Auto),
    ("loan_disbursement", "Loan Disbursement", FundingDirective::Auto),
    ("legal_compliance", "Legal & Compliance", FundingDirective::Capital),
    ("others", "Others", FundingDirective::Auto),
];

impl Default for CategoryCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        for (code, name, destination) in INCOME_SEED {
            catalog.register_income(code, name, destination);
        }
        for (code, name, directive) in EXPENSE_SEED {
            catalog.register_expense(code, name, directive);
        }
        catalog
    }
}

impl CategoryCatalog {
    pub fn empty() -> Self {
        Self {
            income: BTreeMap::new(),
            expense: BTreeMap::new(),
        }
    }

    /// Add or replace an income category.
    pub fn register_income(
        &mut self,
        code: impl Into<String>,
        name: impl Into<String>,
        default_destination: Destination,
    ) {
        let code = code.into();
        self.income.insert(
            code.clone(),
            IncomeCategory {
                code,
                name: name.into(),
                default_destination,
            },
        );
    }

    /// Add or replace an expense category.
    pub fn register_expense(
        &mut self,
        code: impl Into<String>,
        name: impl Into<String>,
        default_directive: FundingDirective,
    ) {
        let code = code.into();
        self.expense.insert(
            code.clone(),
            ExpenseCategory {
                code,
                name: name.into(),
                default_directive,
            },
        );
    }

    pub fn income_categories(&self) -> impl Iterator<Item = &IncomeCategory> {
        self.income.values()
    }

    pub fn expense_categories(&self) -> impl Iterator<Item = &ExpenseCategory> {
        self.expense.values()
    }

    pub fn income(&self, code: &str) -> CashbookResult<&IncomeCategory> {
        self.income
            .get(code)
            .ok_or_else(|| CashbookError::CategoryNotFound(format!("income/{code}")))
    }

    pub fn expense(&self, code: &str) -> CashbookResult<&ExpenseCategory> {
        self.expense
            .get(code)
            .ok_or_else(|| CashbookError::CategoryNotFound(format!("expense/{code}")))
    }

    /// Destination for an income: the explicit one if given, otherwise the
    /// category default. The category must exist either way.
    pub fn income_destination(
        &self,
        code: &str,
        explicit: Option<Destination>,
    ) -> CashbookResult<Destination> {
        let category = self.income(code)?;
        Ok(explicit.unwrap_or(category.default_destination))
    }

    /// Funding directive for an expense, resolved the same way.
    pub fn expense_directive(
        &self,
        code: &str,
        explicit: Option<FundingDirective>,
    ) -> CashbookResult<FundingDirective> {
        let category = self.expense(code)?;
        Ok(explicit.unwrap_or(category.default_directive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_defaults() {
        let catalog = CategoryCatalog::default();
        assert_eq!(
            catalog.income_destination("loan_interest", None).unwrap(),
            Destination::Shu
        );
        assert_eq!(
            catalog.income_destination("mandatory_savings", None).unwrap(),
            Destination::Capital
        );
        assert_eq!(
            catalog.expense_directive("legal_compliance", None).unwrap(),
            FundingDirective::Capital
        );
        assert_eq!(
            catalog.expense_directive("operational", None).unwrap(),
            FundingDirective::Auto
        );
        assert_eq!(catalog.income_categories().count(), 8);
        assert_eq!(catalog.expense_categories().count(), 6);
    }

    #[test]
    fn explicit_choice_overrides_default() {
        let catalog = CategoryCatalog::default();
        assert_eq!(
            catalog
                .expense_directive("operational", Some(FundingDirective::Shu))
                .unwrap(),
            FundingDirective::Shu
        );
        assert_eq!(
            catalog
                .income_destination("donation", Some(Destination::Shu))
                .unwrap(),
            Destination::Shu
        );
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let mut catalog = CategoryCatalog::default();
        let err = catalog.expense_directive("travel", None).unwrap_err();
        assert!(matches!(
            err,
            CashbookError::CategoryNotFound(ref code) if code == "expense/travel"
        ));
        assert!(err.is_rejection());

        catalog.register_expense("travel", "Travel", FundingDirective::Shu);
        assert_eq!(
            catalog.expense_directive("travel", None).unwrap(),
            FundingDirective::Shu
        );
    }
}
