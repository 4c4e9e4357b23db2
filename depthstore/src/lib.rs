pub mod catalog;
pub mod config;
pub mod errors;
pub mod load;
pub mod models;

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::StoreConfig;
use crate::errors::{Result, StoreError};

/// The entry point for the `depthstore` library.
///
/// `DepthStore` owns the relational warehouse behind the expression pipeline:
/// a SQLite catalog holding the four dimension tables (genes, sites, cancer
/// types, samples), the expression fact table, the two heterogeneity score
/// tables, and a run log. Opening the store creates the database file (and
/// its parent directory) if needed and initializes the schema idempotently.
pub struct DepthStore {
    pub config: StoreConfig,
    pub catalog: Arc<Catalog>,
}

impl DepthStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|_| StoreError::DatabaseDir(parent.to_path_buf()))?;
            }
        }

        let catalog = Arc::new(Catalog::new(&config)?);
        catalog.initialize_schema()?;

        Ok(Self { config, catalog })
    }

    /// A store backed by a private in-memory database, used by the demo mode
    /// and tests.
    pub fn in_memory() -> Result<Self> {
        let catalog = Arc::new(Catalog::open_in_memory()?);
        catalog.initialize_schema()?;
        Ok(Self {
            config: StoreConfig::at(":memory:"),
            catalog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_database_and_schema() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        let store = DepthStore::open(config.clone()).unwrap();
        assert!(config.database_path.exists());

        // Schema initialization is idempotent: reopening must not fail.
        drop(store);
        DepthStore::open(config).unwrap();
    }
}
