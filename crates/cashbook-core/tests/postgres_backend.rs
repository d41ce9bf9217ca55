//! Runs against a live PostgreSQL when `CASHBOOK_TEST_DATABASE_URL` is set.
//! The database should be disposable; the cashbook tables are truncated.

#![cfg(feature = "postgres")]

use cashbook_core::postgres::PostgresCashbookStore;
use cashbook_core::{
    BalanceType, CashbookEngine, CashbookError, CashbookStore, Destination, EngineConfig,
    EntryFilter, ExpenseRequest, FundingDirective, IncomeRequest, OpeningBalances,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

async fn fresh_store() -> Option<PostgresCashbookStore> {
    let url = std::env::var("CASHBOOK_TEST_DATABASE_URL").ok()?;
    let store = PostgresCashbookStore::connect_with_options(&url, 8, 5)
        .await
        .expect("connect");
    sqlx::query("TRUNCATE cashbook_entries, cashbook_balances")
        .execute(store.pool())
        .await
        .expect("truncate");
    Some(store)
}

// One test drives the whole flow so parallel test threads never truncate
// under each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_backend_end_to_end() {
    let Some(store) = fresh_store().await else {
        eprintln!("CASHBOOK_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = Arc::new(store);
    let engine = Arc::new(CashbookEngine::new(store.clone(), EngineConfig::default()));

    assert!(matches!(
        engine
            .provision(OpeningBalances::new(Decimal::MAX, dec!(0)))
            .await,
        Err(CashbookError::InvalidAmount(_))
    ));
    engine
        .provision(OpeningBalances::new(dec!(5000000), dec!(0)))
        .await
        .expect("provision");
    assert!(matches!(
        engine
            .provision(OpeningBalances::new(dec!(1), dec!(1)))
            .await,
        Err(CashbookError::AlreadyProvisioned)
    ));

    engine
        .record_income(IncomeRequest::new(dec!(2000000), Destination::Shu, "inc-1"))
        .await
        .expect("income");
    engine
        .record_expense(ExpenseRequest::new(dec!(3000000), FundingDirective::Auto, "exp-1"))
        .await
        .expect("expense 1");
    let spill = engine
        .record_expense(ExpenseRequest::new(dec!(3000000), FundingDirective::Auto, "exp-2"))
        .await
        .expect("expense 2");
    assert_eq!(spill.capital_amount, dec!(2000000));
    assert_eq!(spill.shu_amount, dec!(1000000));

    let err = engine
        .record_expense(ExpenseRequest::new(dec!(5000000), FundingDirective::Shu, "exp-3"))
        .await
        .unwrap_err();
    assert!(err.is_rejection());

    engine.delete_expense("exp-2", None).await.expect("delete");
    let sheet = engine.get_balances().await.expect("balances");
    assert_eq!(
        (sheet.total, sheet.capital, sheet.shu),
        (dec!(4000000), dec!(2000000), dec!(2000000))
    );

    // A held row lock makes the next writer time out.
    let mut holder = store.begin().await.expect("begin");
    holder
        .lock_and_read(&BalanceType::ALL, Duration::from_secs(1))
        .await
        .expect("lock");
    let err = engine
        .record_expense(
            ExpenseRequest::new(dec!(1), FundingDirective::Auto, "exp-4")
                .with_lock_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CashbookError::LockTimeout { waited_ms: 100 }));
    holder.rollback().await.expect("rollback");

    // Two racing expenses, each affordable from capital alone.
    let mut handles = Vec::new();
    for index in 0..2 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .record_expense(ExpenseRequest::new(
                    dec!(1500000),
                    FundingDirective::Capital,
                    format!("race-{index}"),
                ))
                .await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => ok += 1,
            Err(CashbookError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(ok, 1);

    let entries = engine.find_entries(&EntryFilter::recent(2)).await.expect("recent");
    assert_eq!(entries.len(), 2);
    assert!(entries[0].sequence > entries[1].sequence);

    let report = engine.verify().await.expect("verify");
    assert!(report.is_clean(), "{:?}", report.issues);
}
