use cashbook_core::{
    CashbookEngine, CashbookError, Destination, EngineConfig, ExpenseRequest, FundingDirective,
    InMemoryCashbookStore, IncomeRequest, OpeningBalances,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Income(i64, Destination),
    Expense(i64, FundingDirective),
    UpdateExpense(usize, i64, FundingDirective),
    DeleteExpense(usize),
    DeleteIncome(usize),
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

fn destination_strategy() -> impl Strategy<Value = Destination> {
    prop_oneof![Just(Destination::Capital), Just(Destination::Shu)]
}

fn directive_strategy() -> impl Strategy<Value = FundingDirective> {
    prop_oneof![
        Just(FundingDirective::Capital),
        Just(FundingDirective::Shu),
        Just(FundingDirective::Auto),
    ]
}

fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        (1i64..500_000, destination_strategy()).prop_map(|(a, d)| Op::Income(a, d)),
        (1i64..800_000, directive_strategy()).prop_map(|(a, d)| Op::Expense(a, d)),
        (0usize..8, 1i64..800_000, directive_strategy())
            .prop_map(|(i, a, d)| Op::UpdateExpense(i, a, d)),
        (0usize..8).prop_map(Op::DeleteExpense),
        (0usize..8).prop_map(Op::DeleteIncome),
    ];
    prop::collection::vec(op, 1..40)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

async fn engine(capital: Decimal, shu: Decimal) -> CashbookEngine {
    let engine = CashbookEngine::new(
        Arc::new(InMemoryCashbookStore::new()),
        EngineConfig::default(),
    );
    engine
        .provision(OpeningBalances::new(capital, shu))
        .await
        .expect("provision");
    engine
}

proptest! {
    #[test]
    fn property_committed_state_always_balances(
        opening_capital in 0i64..1_000_000,
        opening_shu in 0i64..1_000_000,
        ops in op_strategy(),
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let engine = engine(cents(opening_capital), cents(opening_shu)).await;
            let mut incomes = 0usize;
            let mut expenses = 0usize;

            for op in ops {
                let result = match op {
                    Op::Income(amount, destination) => {
                        incomes += 1;
                        engine
                            .record_income(IncomeRequest::new(
                                cents(amount),
                                destination,
                                format!("inc-{incomes}"),
                            ))
                            .await
                            .map(|_| ())
                    }
                    Op::Expense(amount, directive) => {
                        expenses += 1;
                        let before = engine.get_balances().await.expect("balances");
                        let outcome = engine
                            .record_expense(ExpenseRequest::new(
                                cents(amount),
                                directive,
                                format!("exp-{expenses}"),
                            ))
                            .await;
                        if let Ok(entry) = &outcome {
                            if directive == FundingDirective::Auto
                                && before.capital >= cents(amount)
                            {
                                assert_eq!(entry.shu_amount, Decimal::ZERO);
                            }
                        }
                        outcome.map(|_| ())
                    }
                    Op::UpdateExpense(index, amount, directive) => engine
                        .update_expense(ExpenseRequest::new(
                            cents(amount),
                            directive,
                            format!("exp-{index}"),
                        ))
                        .await
                        .map(|_| ()),
                    Op::DeleteExpense(index) => engine
                        .delete_expense(&format!("exp-{index}"), None)
                        .await
                        .map(|_| ()),
                    Op::DeleteIncome(index) => engine
                        .delete_income(&format!("inc-{index}"), None)
                        .await
                        .map(|_| ()),
                };

                match result {
                    Ok(()) => {}
                    Err(CashbookError::InsufficientFunds { .. })
                    | Err(CashbookError::SourceNotFound(_)) => {}
                    Err(other) => panic!("unexpected error {other:?}"),
                }

                let sheet = engine.get_balances().await.expect("balances");
                assert_eq!(sheet.total, sheet.capital + sheet.shu);
                assert!(sheet.capital >= Decimal::ZERO);
                assert!(sheet.shu >= Decimal::ZERO);
            }

            let report = engine.verify().await.expect("verify");
            assert!(report.is_clean(), "{:?}", report.issues);
        });
    }

    #[test]
    fn property_delete_restores_pre_entry_balances(
        opening_capital in 0i64..1_000_000,
        opening_shu in 0i64..1_000_000,
        amount in 1i64..2_000_000,
        directive in directive_strategy(),
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let engine = engine(cents(opening_capital), cents(opening_shu)).await;
            let before = engine.get_balances().await.expect("balances");

            match engine
                .record_expense(ExpenseRequest::new(cents(amount), directive, "exp-1"))
                .await
            {
                Ok(_) => {
                    engine.delete_expense("exp-1", None).await.expect("delete");
                }
                Err(CashbookError::InsufficientFunds { .. }) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }

            let after = engine.get_balances().await.expect("balances");
            assert_eq!(after.total.to_string(), before.total.to_string());
            assert_eq!(after.capital.to_string(), before.capital.to_string());
            assert_eq!(after.shu.to_string(), before.shu.to_string());
        });
    }

    #[test]
    fn property_income_reversal_round_trips(
        amount in 1i64..2_000_000,
        destination in destination_strategy(),
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let engine = engine(cents(100), Decimal::ZERO).await;
            let before = engine.get_balances().await.expect("balances");
            let entry = engine
                .record_income(IncomeRequest::new(cents(amount), destination, "inc-1"))
                .await
                .expect("income");
            assert_eq!(entry.before, before.snapshot());

            let reversal = engine.delete_income("inc-1", None).await.expect("delete");
            assert_eq!(reversal.after, before.snapshot());
            let after = engine.get_balances().await.expect("balances");
            assert_eq!(after.snapshot(), before.snapshot());
        });
    }
}
