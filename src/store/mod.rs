//! Embedded relational store
//!
//! One SQLite file holds everything: events, epics, projections, the job
//! queue, run log, push subscriptions and the FTS5 search index. Writes go
//! through a single connection behind a mutex (SQLite serialises writers
//! anyway; the mutex keeps transactions whole), reads come from a small
//! r2d2 pool so API queries never wait on pipeline writes in WAL mode.

mod epics;
mod events;
pub mod migrations;
pub mod projections;
mod push;
pub mod runs;
mod search;
pub mod types;

pub use search::{sanitize_fts_query, SearchHit};

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct Store {
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring the
    /// schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut writer = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        writer.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        migrations::apply_all(&mut writer)?;

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")
        });
        let readers = Pool::builder().max_size(4).build(manager)?;

        // Verify a pooled connection works before handing the store out.
        readers
            .get()?
            .query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
        })
    }

    /// In-memory store for tests; same schema as `open`.
    #[cfg(test)]
    pub fn open_temp() -> Result<(tempfile::TempDir, Self)> {
        let dir = tempfile::tempdir()?;
        let store = Self::open(dir.path().join("memodesk.db"))?;
        Ok((dir, store))
    }

    /// Exclusive handle for mutation. Mutex poisoning means a writer
    /// panicked mid-transaction; propagate rather than limp on.
    pub(crate) fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Store writer mutex poisoned; continuing with recovered guard");
            poisoned.into_inner()
        })
    }

    /// Pooled read-only connection.
    pub(crate) fn reader(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.readers.get()?)
    }

    /// Drop every core table. Destructive; admin/test use only.
    pub fn rollback_all(&self) -> Result<()> {
        self.writer().execute_batch(migrations::ROLLBACK_ALL)?;
        Ok(())
    }
}
