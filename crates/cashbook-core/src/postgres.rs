//! PostgreSQL cashbook store.
//!
//! A unit of work is one database transaction. Balance rows are locked with
//! `SELECT ... FOR UPDATE` under a transaction-local `lock_timeout`, so the
//! lock wait is bounded by the server and surfaces as SQLSTATE 55P03.
//! Ledger rows are inserted inside the same transaction and become visible
//! with the balance update on commit.

use crate::error::{CashbookError, CashbookResult};
use crate::ledger;
use crate::store::{CashbookStore, UnitOfWork};
use crate::types::{
    now_micros, Balance, BalanceSheet, BalanceSnapshot, BalanceType, EntryFilter, LedgerEntry,
    LedgerEntryDraft, OpeningBalances, SourceKind, SourceRef,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

const ENTRY_COLUMNS: &str = r#"
    sequence, entry_id, direction, shu_amount, capital_amount,
    total_before, capital_before, shu_before, total_after, capital_after, shu_after,
    source_kind, source_id, user_ref, category_ref, reverses,
    occurred_at, created_at, previous_hash, entry_hash
"#;

// Every optional predicate is bound; NULL disables it.
const ENTRY_FILTER: &str = r#"
    WHERE ($1::timestamptz IS NULL OR occurred_at >= $1)
      AND ($2::timestamptz IS NULL OR occurred_at <= $2)
      AND ($3::text IS NULL OR direction = $3)
      AND ($4::text IS NULL OR user_ref = $4)
      AND ($5::text IS NULL OR category_ref = $5)
      AND ($6::text IS NULL OR source_kind = $6)
      AND ($7::text IS NULL OR source_id = $7)
"#;

/// PostgreSQL-backed cashbook store.
#[derive(Clone)]
pub struct PostgresCashbookStore {
    pool: PgPool,
}

impl PostgresCashbookStore {
    /// Connect with default pool parameters and initialize the schema.
    pub async fn connect(database_url: &str) -> CashbookResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> CashbookResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| CashbookError::Storage(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool.
    pub async fn from_pool(pool: PgPool) -> CashbookResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> CashbookResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS cashbook_balances (
                balance_type TEXT PRIMARY KEY
                    CHECK (balance_type IN ('total', 'capital', 'shu')),
                amount NUMERIC(20,4) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK (amount >= 0)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cashbook_entries (
                sequence BIGINT PRIMARY KEY,
                entry_id UUID NOT NULL UNIQUE,
                direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
                shu_amount NUMERIC(16,4) NOT NULL CHECK (shu_amount >= 0),
                capital_amount NUMERIC(16,4) NOT NULL CHECK (capital_amount >= 0),
                total_before NUMERIC(20,4) NOT NULL,
                capital_before NUMERIC(20,4) NOT NULL,
                shu_before NUMERIC(20,4) NOT NULL,
                total_after NUMERIC(20,4) NOT NULL,
                capital_after NUMERIC(20,4) NOT NULL,
                shu_after NUMERIC(20,4) NOT NULL,
                source_kind TEXT NOT NULL CHECK (source_kind IN ('income', 'expense')),
                source_id TEXT NOT NULL,
                user_ref TEXT,
                category_ref TEXT,
                reverses UUID REFERENCES cashbook_entries (entry_id),
                occurred_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                previous_hash TEXT,
                entry_hash TEXT NOT NULL,
                CHECK (shu_amount + capital_amount > 0)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cashbook_entries_source ON cashbook_entries (source_kind, source_id)",
            "CREATE INDEX IF NOT EXISTS idx_cashbook_entries_occurred_at ON cashbook_entries (occurred_at)",
            "CREATE INDEX IF NOT EXISTS idx_cashbook_entries_user_ref ON cashbook_entries (user_ref)",
            "CREATE INDEX IF NOT EXISTS idx_cashbook_entries_category_ref ON cashbook_entries (category_ref)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| CashbookError::Storage(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CashbookStore for PostgresCashbookStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn provision(&self, opening: OpeningBalances) -> CashbookResult<BalanceSheet> {
        let rows = opening.into_rows(now_micros())?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cashbook_balances")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if existing > 0 {
            return Err(CashbookError::AlreadyProvisioned);
        }

        let mut provisioned = BTreeMap::new();
        for row in rows {
            sqlx::query(
                "INSERT INTO cashbook_balances (balance_type, amount, updated_at) VALUES ($1, $2, $3)",
            )
            .bind(row.balance_type.as_str())
            .bind(row.amount)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_provision_error)?;
            provisioned.insert(row.balance_type, row);
        }

        tx.commit().await.map_err(map_provision_error)?;
        BalanceSheet::from_rows(&provisioned)
    }

    async fn begin(&self) -> CashbookResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PostgresUnit {
            tx,
            locked: BTreeSet::new(),
        }))
    }

    async fn balances(&self) -> CashbookResult<BalanceSheet> {
        let rows = sqlx::query("SELECT balance_type, amount, updated_at FROM cashbook_balances")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut balances = BTreeMap::new();
        for row in rows {
            let balance = row_to_balance(&row)?;
            balances.insert(balance.balance_type, balance);
        }
        BalanceSheet::from_rows(&balances)
    }

    async fn find_entries(&self, filter: &EntryFilter) -> CashbookResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM cashbook_entries {ENTRY_FILTER} ORDER BY sequence DESC LIMIT $8 OFFSET $9"
        );
        let limit = filter.limit.map(to_i64).transpose()?;
        let offset = to_i64(filter.offset.unwrap_or(0))?;
        let rows = bind_filter(sqlx::query(&sql), filter)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn count_entries(&self, filter: &EntryFilter) -> CashbookResult<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM cashbook_entries {ENTRY_FILTER}");
        let row = bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let total: i64 = row.try_get("total").map_err(map_sqlx)?;
        Ok(total.max(0) as u64)
    }

    async fn all_entries(&self) -> CashbookResult<Vec<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM cashbook_entries ORDER BY sequence ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_entry).collect()
    }
}

struct PostgresUnit {
    tx: Transaction<'static, Postgres>,
    locked: BTreeSet<BalanceType>,
}

#[async_trait]
impl UnitOfWork for PostgresUnit {
    async fn lock_and_read(
        &mut self,
        types: &[BalanceType],
        timeout: Duration,
    ) -> CashbookResult<BTreeMap<BalanceType, Balance>> {
        if !self.locked.is_empty() {
            return Err(CashbookError::InvariantViolation(
                "balances already locked by this unit".to_string(),
            ));
        }

        let waited_ms = timeout.as_millis().max(1) as u64;
        // SET does not take bind parameters; the value is an integer we format.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{waited_ms}ms'"))
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        let wanted: BTreeSet<BalanceType> = types.iter().copied().collect();
        let labels: Vec<String> = wanted.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT balance_type, amount, updated_at
            FROM cashbook_balances
            WHERE balance_type = ANY($1::text[])
            ORDER BY balance_type
            FOR UPDATE
            "#,
        )
        .bind(&labels)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| match map_sqlx(e) {
            CashbookError::LockTimeout { .. } => CashbookError::LockTimeout { waited_ms },
            other => other,
        })?;

        let mut read = BTreeMap::new();
        for row in rows {
            let balance = row_to_balance(&row)?;
            read.insert(balance.balance_type, balance);
        }
        if let Some(missing) = wanted.iter().find(|t| !read.contains_key(*t)) {
            return Err(CashbookError::BalanceNotFound(*missing));
        }

        debug!(rows = read.len(), lock_timeout_ms = waited_ms, "Balance rows locked");
        self.locked = wanted;
        Ok(read)
    }

    async fn apply_delta(
        &mut self,
        balance_type: BalanceType,
        delta: Decimal,
    ) -> CashbookResult<Balance> {
        if !self.locked.contains(&balance_type) {
            return Err(CashbookError::InvariantViolation(format!(
                "balance '{balance_type}' is not locked by this unit"
            )));
        }
        let row = sqlx::query(
            r#"
            UPDATE cashbook_balances
            SET amount = amount + $1, updated_at = $2
            WHERE balance_type = $3
            RETURNING balance_type, amount, updated_at
            "#,
        )
        .bind(delta)
        .bind(now_micros())
        .bind(balance_type.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        row_to_balance(&row)
    }

    async fn entries_for_source(
        &mut self,
        source: &SourceRef,
    ) -> CashbookResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM cashbook_entries WHERE source_kind = $1 AND source_id = $2 ORDER BY sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(source.kind.as_str())
            .bind(&source.id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn append(&mut self, draft: LedgerEntryDraft) -> CashbookResult<LedgerEntry> {
        if let Some(missing) = BalanceType::ALL
            .iter()
            .find(|balance_type| !self.locked.contains(balance_type))
        {
            return Err(CashbookError::InvariantViolation(format!(
                "append requires every balance locked; '{missing}' is not"
            )));
        }

        let tail = sqlx::query(
            "SELECT sequence, entry_hash FROM cashbook_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        let (sequence, previous_hash) = match tail {
            Some(row) => {
                let last: i64 = row.try_get("sequence").map_err(map_sqlx)?;
                let hash: String = row.try_get("entry_hash").map_err(map_sqlx)?;
                (last as u64 + 1, Some(hash))
            }
            None => (1, None),
        };

        let entry = ledger::seal(draft, sequence, previous_hash, now_micros())?;
        sqlx::query(&format!(
            "INSERT INTO cashbook_entries ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(entry.sequence as i64)
        .bind(entry.entry_id)
        .bind(entry.direction.as_str())
        .bind(entry.shu_amount)
        .bind(entry.capital_amount)
        .bind(entry.before.total)
        .bind(entry.before.capital)
        .bind(entry.before.shu)
        .bind(entry.after.total)
        .bind(entry.after.capital)
        .bind(entry.after.shu)
        .bind(entry.source.kind.as_str())
        .bind(&entry.source.id)
        .bind(&entry.user_ref)
        .bind(&entry.category_ref)
        .bind(entry.reverses)
        .bind(entry.occurred_at)
        .bind(entry.created_at)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&mut *self.tx)
        .await
        .map_err(map_append_error)?;
        Ok(entry)
    }

    async fn commit(self: Box<Self>) -> CashbookResult<()> {
        let PostgresUnit { tx, .. } = *self;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> CashbookResult<()> {
        let PostgresUnit { tx, .. } = *self;
        tx.rollback().await.map_err(map_sqlx)
    }
}

fn bind_filter<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    filter: &EntryFilter,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(filter.direction.map(|d| d.as_str().to_string()))
        .bind(filter.user_ref.clone())
        .bind(filter.category_ref.clone())
        .bind(filter.source.as_ref().map(|s| s.kind.as_str().to_string()))
        .bind(filter.source.as_ref().map(|s| s.id.clone()))
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn map_sqlx(err: sqlx::Error) -> CashbookError {
    match sqlstate(&err).as_deref() {
        Some("55P03") => CashbookError::LockTimeout { waited_ms: 0 },
        Some("40001") | Some("40P01") => CashbookError::CommitConflict(err.to_string()),
        Some("23514") => CashbookError::InvariantViolation(err.to_string()),
        Some("22003") => CashbookError::InvalidAmount(err.to_string()),
        _ => CashbookError::Storage(err.to_string()),
    }
}

fn map_provision_error(err: sqlx::Error) -> CashbookError {
    if sqlstate(&err).as_deref() == Some("23505") {
        return CashbookError::AlreadyProvisioned;
    }
    map_sqlx(err)
}

fn map_append_error(err: sqlx::Error) -> CashbookError {
    if sqlstate(&err).as_deref() == Some("23505") {
        return CashbookError::CommitConflict(format!("ledger sequence taken: {err}"));
    }
    map_sqlx(err)
}

fn to_i64(value: usize) -> CashbookResult<i64> {
    i64::try_from(value)
        .map_err(|_| CashbookError::InvalidEntry("window value too large".to_string()))
}

fn row_to_balance(row: &PgRow) -> CashbookResult<Balance> {
    let label: String = row.try_get("balance_type").map_err(map_sqlx)?;
    Ok(Balance {
        balance_type: label.parse()?,
        amount: row.try_get("amount").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn row_to_entry(row: &PgRow) -> CashbookResult<LedgerEntry> {
    let get_decimal = |column: &str| -> CashbookResult<Decimal> {
        row.try_get::<Decimal, _>(column).map_err(map_sqlx)
    };
    let sequence: i64 = row.try_get("sequence").map_err(map_sqlx)?;
    let direction: String = row.try_get("direction").map_err(map_sqlx)?;
    let source_kind: String = row.try_get("source_kind").map_err(map_sqlx)?;

    Ok(LedgerEntry {
        entry_id: row.try_get("entry_id").map_err(map_sqlx)?,
        sequence: sequence as u64,
        direction: direction.parse()?,
        shu_amount: get_decimal("shu_amount")?,
        capital_amount: get_decimal("capital_amount")?,
        before: BalanceSnapshot {
            total: get_decimal("total_before")?,
            capital: get_decimal("capital_before")?,
            shu: get_decimal("shu_before")?,
        },
        after: BalanceSnapshot {
            total: get_decimal("total_after")?,
            capital: get_decimal("capital_after")?,
            shu: get_decimal("shu_after")?,
        },
        source: SourceRef {
            kind: source_kind.parse::<SourceKind>()?,
            id: row.try_get("source_id").map_err(map_sqlx)?,
        },
        user_ref: row.try_get("user_ref").map_err(map_sqlx)?,
        category_ref: row.try_get("category_ref").map_err(map_sqlx)?,
        reverses: row.try_get("reverses").map_err(map_sqlx)?,
        occurred_at: row.try_get("occurred_at").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        previous_hash: row.try_get("previous_hash").map_err(map_sqlx)?,
        entry_hash: row.try_get("entry_hash").map_err(map_sqlx)?,
    })
}
