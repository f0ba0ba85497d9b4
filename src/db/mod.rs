//! Pooled SQLite access. Grounded in the teacher's `VaultDb`
//! (`vault/vault_db.rs`): a single connection behind an async mutex, WAL
//! mode, `CREATE TABLE IF NOT EXISTS` at construction.

mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        for stmt in schema::STATEMENTS {
            conn.execute(stmt, []).with_context(|| format!("running schema statement: {stmt}"))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        for stmt in schema::STATEMENTS {
            conn.execute(stmt, []).with_context(|| format!("running schema statement: {stmt}"))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection. Callers run synchronous `rusqlite` calls (and,
    /// where needed, open a `conn.transaction()`) while holding the guard;
    /// because the mutex admits only one holder at a time this is the
    /// substitute for row-level `SELECT ... FOR UPDATE SKIP LOCKED` that
    /// spec.md §5 allows for single-writer stores.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
