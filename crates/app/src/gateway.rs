use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use swapledger_core_types::Swap;
use swapledger_storage::{is_retryable_sqlite_anyhow_error, SqliteStore};
use tracing::warn;

use crate::telemetry::format_error_chain;

/// Idempotent swap writer over one SQLite connection. A failed batch is
/// retried once on a fresh connection before the error is surfaced.
pub(crate) struct PersistenceGateway {
    sqlite_path: PathBuf,
    store: SqliteStore,
}

impl PersistenceGateway {
    pub(crate) fn open(sqlite_path: &Path) -> Result<Self> {
        let store = SqliteStore::open(sqlite_path).with_context(|| {
            format!(
                "failed to open sqlite db for sync task: {}",
                sqlite_path.display()
            )
        })?;
        Ok(Self::from_store(sqlite_path, store))
    }

    pub(crate) fn from_store(sqlite_path: &Path, store: SqliteStore) -> Self {
        Self {
            sqlite_path: sqlite_path.to_path_buf(),
            store,
        }
    }

    pub(crate) fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Inserts unseen swaps and returns how many were new.
    pub(crate) fn upsert_batch(&mut self, swaps: &[Swap]) -> Result<usize> {
        match self.store.upsert_swaps(swaps) {
            Ok(inserted) => Ok(inserted),
            Err(first_error) => {
                warn!(
                    error = %format_error_chain(&first_error),
                    batch = swaps.len(),
                    contended = is_retryable_sqlite_anyhow_error(&first_error),
                    "swap batch write failed, reopening sqlite connection"
                );
                self.store = SqliteStore::open(&self.sqlite_path).with_context(|| {
                    format!(
                        "failed to reopen sqlite db after write failure: {}",
                        self.sqlite_path.display()
                    )
                })?;
                self.store
                    .upsert_swaps(swaps)
                    .context("swap batch write failed after reconnect")
            }
        }
    }
}
