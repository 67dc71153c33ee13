//! Run Store (spec §4.6): durable relational persistence for a run.
//!
//! Grounded in the donor's `factory/db.rs` (`FactoryDb::new`/`init`/
//! `run_migrations` via one `execute_batch` of `CREATE TABLE IF NOT
//! EXISTS` statements, journaled with WAL and foreign keys on). The
//! donor's Kanban tables (`projects`, `issues`, `pipeline_runs`) are
//! replaced here with the run/task/loop/context schema spec §3 and
//! §4.6 describe.

mod context;
mod costs;
mod loops;
mod reviews;
mod runs;
mod schema;
mod tasks;

pub use context::ContextFilters;

use std::path::Path;

use rusqlite::Connection;

use crate::errors::{SqResult, StoreError};

pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    pub fn open(path: &Path) -> SqResult<Self> {
        let conn = Connection::open(path).map_err(StoreError::Database)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> SqResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Database)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SqResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(StoreError::Database)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(StoreError::Database)?;
        schema::run_migrations(&conn)?;
        Ok(RunStore { conn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_migrates() {
        let store = RunStore::open_in_memory().unwrap();
        // migrations ran without error; tables queryable
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type='table'", [], |row| row.get(0))
            .unwrap();
        assert!(count >= 7);
    }
}
