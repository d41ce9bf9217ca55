//! `cashbook` - operator CLI for the cooperative cashbook.
//!
//! Every command prints JSON on stdout. Logs go to stderr and follow
//! `RUST_LOG`.

use cashbook_core::{
    CashbookEngine, Destination, Direction, EngineConfig, EntryFilter, ExpenseRequest,
    FundingDirective, IncomeRequest, OpeningBalances, StorageConfig,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

mod demo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "cashbook", version, about = "Cooperative cashbook ledger")]
struct Cli {
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "CASHBOOK_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url; falls back to DATABASE_URL.
    #[arg(long, env = "CASHBOOK_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "CASHBOOK_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Upper bound on balance lock waits, in milliseconds.
    #[arg(long, default_value_t = 5000, env = "CASHBOOK_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision the three balances. Runs once per database.
    Init {
        #[arg(long, default_value = "0")]
        capital: Decimal,
        #[arg(long, default_value = "0")]
        shu: Decimal,
    },
    /// Record an income.
    Income(IncomeArgs),
    /// Record an expense.
    Expense(ExpenseArgs),
    /// Replace an expense with a new amount and funding choice.
    UpdateExpense(ExpenseArgs),
    /// Reverse an expense.
    DeleteExpense {
        #[arg(long)]
        id: String,
    },
    /// Replace an income with a new amount and destination.
    UpdateIncome(IncomeArgs),
    /// Reverse an income.
    DeleteIncome {
        #[arg(long)]
        id: String,
    },
    /// Show the current balances.
    Balances,
    /// List entries, newest first.
    Recent(FilterArgs),
    /// Income/expense totals over matching entries.
    Summary(FilterArgs),
    /// Replay the ledger and check it against the balances.
    Verify,
    /// List known income and expense categories.
    Categories,
    /// Run the reference scenarios against an in-memory store.
    Demo,
}

impl Command {
    /// Whether the command reads or writes state that must outlive the process.
    fn needs_durable_store(&self) -> bool {
        !matches!(self, Self::Categories | Self::Demo)
    }
}

#[derive(Debug, Args)]
struct IncomeArgs {
    /// Income record id.
    #[arg(long)]
    id: String,
    #[arg(long)]
    amount: Decimal,
    /// Target balance; defaults to the category's destination.
    #[arg(long)]
    destination: Option<Destination>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct ExpenseArgs {
    /// Expense record id.
    #[arg(long)]
    id: String,
    #[arg(long)]
    amount: Decimal,
    /// capital, shu or auto; defaults to the category's directive.
    #[arg(long = "from")]
    directive: Option<FundingDirective>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    date_from: Option<DateTime<Utc>>,
    #[arg(long)]
    date_to: Option<DateTime<Utc>>,
    /// in or out.
    #[arg(long)]
    direction: Option<Direction>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long, default_value_t = 10)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

impl FilterArgs {
    fn to_filter(&self) -> EntryFilter {
        EntryFilter {
            date_from: self.date_from,
            date_to: self.date_to,
            direction: self.direction,
            user_ref: self.user.clone(),
            category_ref: self.category.clone(),
            source: None,
            limit: Some(self.limit),
            offset: Some(self.offset),
        }
    }
}

/// Pick the backend. `fallback_url` is the process-wide `DATABASE_URL`.
fn resolve_storage(cli: &Cli, fallback_url: Option<String>) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli.database_url.clone().or(fallback_url);

    let storage = match cli.storage {
        StorageMode::Memory => {
            if cli.command.needs_durable_store() {
                warn!("Using an in-memory store; state is discarded when the process exits");
            }
            StorageConfig::Memory
        }
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None if cli.command.needs_durable_store() => anyhow::bail!(
                "no database configured: set --database-url, CASHBOOK_DATABASE_URL or \
                 DATABASE_URL (or pass --storage memory for a throwaway store)"
            ),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        lock_timeout: Duration::from_millis(cli.lock_timeout_ms),
        ..EngineConfig::default()
    }
}

fn income_request(engine: &CashbookEngine, args: IncomeArgs) -> anyhow::Result<IncomeRequest> {
    let destination = match (&args.category, args.destination) {
        (Some(category), explicit) => engine.resolve_destination(category, explicit)?,
        (None, Some(destination)) => destination,
        (None, None) => anyhow::bail!("income needs --destination or --category"),
    };
    let mut request = IncomeRequest::new(args.amount, destination, args.id);
    request.user_ref = args.user;
    request.category_ref = args.category;
    request.occurred_at = args.occurred_at;
    Ok(request)
}

fn expense_request(engine: &CashbookEngine, args: ExpenseArgs) -> anyhow::Result<ExpenseRequest> {
    let directive = match (&args.category, args.directive) {
        (Some(category), explicit) => engine.resolve_directive(category, explicit)?,
        (None, Some(directive)) => directive,
        (None, None) => FundingDirective::Auto,
    };
    let mut request = ExpenseRequest::new(args.amount, directive, args.id);
    request.user_ref = args.user;
    request.category_ref = args.category;
    request.occurred_at = args.occurred_at;
    Ok(request)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(engine: &CashbookEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init { capital, shu } => {
            print_json(&engine.provision(OpeningBalances::new(capital, shu)).await?)
        }
        Command::Income(args) => {
            let request = income_request(engine, args)?;
            print_json(&engine.record_income(request).await?)
        }
        Command::Expense(args) => {
            let request = expense_request(engine, args)?;
            print_json(&engine.record_expense(request).await?)
        }
        Command::UpdateExpense(args) => {
            let request = expense_request(engine, args)?;
            print_json(&engine.update_expense(request).await?)
        }
        Command::DeleteExpense { id } => print_json(&engine.delete_expense(&id, None).await?),
        Command::UpdateIncome(args) => {
            let request = income_request(engine, args)?;
            print_json(&engine.update_income(request).await?)
        }
        Command::DeleteIncome { id } => print_json(&engine.delete_income(&id, None).await?),
        Command::Balances => print_json(&engine.get_balances().await?),
        Command::Recent(args) => {
            let filter = args.to_filter();
            let count = engine.count_entries(&filter).await?;
            let entries = engine.find_entries(&filter).await?;
            print_json(&serde_json::json!({ "count": count, "entries": entries }))
        }
        Command::Summary(args) => print_json(&engine.get_summary(&args.to_filter()).await?),
        Command::Verify => {
            let report = engine.verify().await?;
            print_json(&report)?;
            if !report.is_clean() {
                anyhow::bail!("ledger verification found {} issue(s)", report.issues.len());
            }
            Ok(())
        }
        Command::Categories => {
            let catalog = engine.categories();
            print_json(&serde_json::json!({
                "income": catalog.income_categories().collect::<Vec<_>>(),
                "expense": catalog.expense_categories().collect::<Vec<_>>(),
            }))
        }
        Command::Demo => print_json(&demo::run().await?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cashbook=info,info".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli, std::env::var("DATABASE_URL").ok())?;
    info!(backend = storage.label(), "Opening cashbook");
    let engine = CashbookEngine::bootstrap(storage, engine_config(&cli)).await?;
    run(&engine, cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashbook_core::InMemoryCashbookStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn memory_engine() -> CashbookEngine {
        CashbookEngine::new(Arc::new(InMemoryCashbookStore::new()), EngineConfig::default())
    }

    #[test]
    fn explicit_memory_ignores_database_url() {
        let cli = parse(&[
            "cashbook",
            "--storage",
            "memory",
            "--database-url",
            "postgres://localhost/cashbook",
            "balances",
        ]);
        assert_eq!(resolve_storage(&cli, None).unwrap(), StorageConfig::Memory);
    }

    #[test]
    fn auto_without_database_refuses_stateful_commands() {
        for args in [
            &["cashbook", "init", "--capital", "100"][..],
            &["cashbook", "expense", "--id", "exp-1", "--amount", "5"][..],
            &["cashbook", "verify"][..],
        ] {
            let err = resolve_storage(&parse(args), None).unwrap_err();
            assert!(err.to_string().contains("no database configured"), "{args:?}");
        }

        for args in [&["cashbook", "demo"][..], &["cashbook", "categories"][..]] {
            assert_eq!(
                resolve_storage(&parse(args), None).unwrap(),
                StorageConfig::Memory
            );
        }
    }

    #[test]
    fn auto_falls_back_to_database_url() {
        let cli = parse(&["cashbook", "balances"]);
        assert_eq!(
            resolve_storage(&cli, Some("postgres://db/cashbook".to_string())).unwrap(),
            StorageConfig::postgres("postgres://db/cashbook", 5)
        );
    }

    #[test]
    fn auto_uses_postgres_when_url_given() {
        let cli = parse(&[
            "cashbook",
            "--database-url",
            "postgres://localhost/cashbook",
            "--pg-max-connections",
            "3",
            "balances",
        ]);
        assert_eq!(
            resolve_storage(&cli, None).unwrap(),
            StorageConfig::postgres("postgres://localhost/cashbook", 3)
        );
    }

    #[test]
    fn lock_timeout_flag_feeds_engine_config() {
        let cli = parse(&["cashbook", "--lock-timeout-ms", "250", "verify"]);
        assert_eq!(engine_config(&cli).lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn expense_args_parse_decimal_and_directive() {
        let cli = parse(&[
            "cashbook",
            "expense",
            "--id",
            "exp-9",
            "--amount",
            "1250.5",
            "--from",
            "shu",
        ]);
        match cli.command {
            Command::Expense(args) => {
                assert_eq!(args.amount, dec!(1250.5));
                assert_eq!(args.directive, Some(FundingDirective::Shu));
                let request = expense_request(&memory_engine(), args).unwrap();
                assert_eq!(request.directive, FundingDirective::Shu);
                assert_eq!(request.source_id, "exp-9");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn category_supplies_default_routing() {
        let engine = memory_engine();
        let cli = parse(&[
            "cashbook",
            "income",
            "--id",
            "inc-1",
            "--amount",
            "10",
            "--category",
            "loan_interest",
        ]);
        let Command::Income(args) = cli.command else {
            panic!("expected income");
        };
        let request = income_request(&engine, args).unwrap();
        assert_eq!(request.destination, Destination::Shu);
        assert_eq!(request.category_ref.as_deref(), Some("loan_interest"));

        let cli = parse(&["cashbook", "income", "--id", "inc-2", "--amount", "10"]);
        let Command::Income(args) = cli.command else {
            panic!("expected income");
        };
        assert!(income_request(&engine, args).is_err());
    }

    #[tokio::test]
    async fn commands_run_against_memory_store() {
        let engine = memory_engine();
        run(
            &engine,
            Command::Init {
                capital: dec!(100),
                shu: dec!(0),
            },
        )
        .await
        .unwrap();
        let cli = parse(&[
            "cashbook", "expense", "--id", "exp-1", "--amount", "40", "--category", "operational",
        ]);
        run(&engine, cli.command).await.unwrap();
        run(&engine, Command::Verify).await.unwrap();

        let sheet = engine.get_balances().await.unwrap();
        assert_eq!(sheet.capital, dec!(60));
    }
}
