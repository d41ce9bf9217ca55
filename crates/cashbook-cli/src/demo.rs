//! Reference walk-through on a fresh in-memory store, seeded with
//! TOTAL = CAPITAL = 5,000,000 and SHU = 0.

use cashbook_core::{
    BalanceSheet, CashbookEngine, CashbookResult, Destination, EngineConfig, ExpenseRequest,
    FundingDirective, InMemoryCashbookStore, IncomeRequest, OpeningBalances,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;

fn balances(sheet: &BalanceSheet) -> Value {
    json!({
        "total": sheet.total,
        "capital": sheet.capital,
        "shu": sheet.shu,
    })
}

pub async fn run() -> CashbookResult<Value> {
    let engine = CashbookEngine::new(
        Arc::new(InMemoryCashbookStore::new()),
        EngineConfig::default(),
    );
    let seed = engine
        .provision(OpeningBalances::new(Decimal::new(5_000_000, 0), Decimal::ZERO))
        .await?;
    let mut steps = vec![json!({ "step": "provision", "balances": balances(&seed) })];

    let income = engine
        .record_income(IncomeRequest::new(
            Decimal::new(2_000_000, 0),
            Destination::Shu,
            "demo-income-1",
        ))
        .await?;
    steps.push(json!({
        "step": "income 2,000,000 to shu",
        "entry": income,
        "balances": balances(&engine.get_balances().await?),
    }));

    for (label, id) in [
        ("expense 3,000,000 auto (capital covers)", "demo-expense-1"),
        ("expense 3,000,000 auto (spills into shu)", "demo-expense-2"),
    ] {
        let entry = engine
            .record_expense(ExpenseRequest::new(
                Decimal::new(3_000_000, 0),
                FundingDirective::Auto,
                id,
            ))
            .await?;
        steps.push(json!({
            "step": label,
            "entry": entry,
            "balances": balances(&engine.get_balances().await?),
        }));
    }

    let refused = engine
        .record_expense(ExpenseRequest::new(
            Decimal::new(5_000_000, 0),
            FundingDirective::Shu,
            "demo-expense-3",
        ))
        .await;
    steps.push(json!({
        "step": "expense 5,000,000 from shu",
        "error": refused.err().map(|err| err.to_string()),
        "balances": balances(&engine.get_balances().await?),
    }));

    let reversal = engine.delete_expense("demo-expense-2", None).await?;
    steps.push(json!({
        "step": "delete second expense",
        "entry": reversal,
        "balances": balances(&engine.get_balances().await?),
    }));

    let report = engine.verify().await?;
    Ok(json!({ "steps": steps, "verification": report }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_ends_back_at_scenario_two_state() {
        let output = run().await.unwrap();
        let steps = output["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 6);
        assert!(steps[4]["error"]
            .as_str()
            .unwrap()
            .contains("insufficient funds from shu"));
        assert_eq!(output["verification"]["issues"].as_array().unwrap().len(), 0);

        let last = &steps[5]["balances"];
        let capital: Decimal = last["capital"].as_str().unwrap().parse().unwrap();
        let shu: Decimal = last["shu"].as_str().unwrap().parse().unwrap();
        assert_eq!(capital, Decimal::new(2_000_000, 0));
        assert_eq!(shu, Decimal::new(2_000_000, 0));
    }
}
