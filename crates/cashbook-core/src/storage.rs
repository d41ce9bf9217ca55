use crate::error::CashbookResult;
use crate::memory::InMemoryCashbookStore;
use crate::store::CashbookStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where balances and the ledger live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageConfig {
    /// Process memory only; state is lost on exit.
    Memory,
    /// PostgreSQL; schema is created on first connect.
    Postgres {
        database_url: String,
        max_connections: u32,
        connect_timeout_secs: u64,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
            connect_timeout_secs: 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Open the configured backend.
pub async fn bootstrap_store(config: StorageConfig) -> CashbookResult<Arc<dyn CashbookStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryCashbookStore::new())),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            database_url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = crate::postgres::PostgresCashbookStore::connect_with_options(
                &database_url,
                max_connections,
                connect_timeout_secs,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(crate::error::CashbookError::Storage(
            "postgres storage requires the 'postgres' feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CashbookError;

    #[test]
    fn labels_and_defaults() {
        assert_eq!(StorageConfig::default(), StorageConfig::Memory);
        assert_eq!(StorageConfig::memory().label(), "memory");
        let pg = StorageConfig::postgres("postgres://localhost/cashbook", 4);
        assert_eq!(pg.label(), "postgres");
        assert!(matches!(
            pg,
            StorageConfig::Postgres {
                max_connections: 4,
                connect_timeout_secs: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn memory_bootstrap_starts_unprovisioned() {
        let store = bootstrap_store(StorageConfig::Memory).await.unwrap();
        assert_eq!(store.backend_label(), "memory");
        assert!(matches!(
            store.balances().await,
            Err(CashbookError::BalanceNotFound(_))
        ));
    }
}
