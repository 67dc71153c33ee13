//! Table definitions and migrations. One `execute_batch` call per the
//! donor's `factory/db.rs::run_migrations`, `CREATE TABLE IF NOT EXISTS`
//! throughout so re-opening an existing `state.db` is a no-op.

use rusqlite::Connection;

use crate::errors::{SqResult, StoreError};

pub fn run_migrations(conn: &Connection) -> SqResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id                  TEXT PRIMARY KEY,
            spec_path           TEXT NOT NULL,
            effort              TEXT NOT NULL,
            phase               TEXT NOT NULL,
            config_json         TEXT NOT NULL,
            codebase_analysis_json TEXT,
            was_empty_project   INTEGER,
            pending_review      TEXT,
            revision_count      INTEGER NOT NULL DEFAULT 0,
            pending_conflicts_json TEXT NOT NULL DEFAULT '[]',
            total_cost_usd      REAL NOT NULL DEFAULT 0,
            per_phase_cost_json TEXT NOT NULL DEFAULT '{}',
            per_loop_cost_json  TEXT NOT NULL DEFAULT '{}',
            per_run_max_usd     REAL NOT NULL,
            per_phase_max_usd   REAL NOT NULL,
            per_loop_max_usd    REAL NOT NULL,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS phase_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            phase       TEXT NOT NULL,
            success     INTEGER NOT NULL,
            summary     TEXT NOT NULL,
            cost_usd    REAL NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_phase_history_run ON phase_history(run_id);

        CREATE TABLE IF NOT EXISTS tasks (
            id                  TEXT NOT NULL,
            run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            title               TEXT NOT NULL,
            description         TEXT NOT NULL,
            status              TEXT NOT NULL,
            dependencies_json   TEXT NOT NULL DEFAULT '[]',
            estimated_iterations INTEGER NOT NULL DEFAULT 1,
            assigned_loop       TEXT,
            position            INTEGER NOT NULL,
            PRIMARY KEY (run_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);

        CREATE TABLE IF NOT EXISTS plan_groups (
            run_id       TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            group_index  INTEGER NOT NULL,
            task_ids_json TEXT NOT NULL,
            PRIMARY KEY (run_id, group_index)
        );

        CREATE TABLE IF NOT EXISTS loops (
            id                          TEXT NOT NULL,
            run_id                      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            task_ids_json               TEXT NOT NULL,
            iteration                   INTEGER NOT NULL DEFAULT 0,
            max_iterations              INTEGER NOT NULL,
            review_interval             INTEGER NOT NULL,
            last_checkpoint_review_at   INTEGER NOT NULL DEFAULT 0,
            status                      TEXT NOT NULL,
            same_error_count            INTEGER NOT NULL DEFAULT 0,
            no_progress_count           INTEGER NOT NULL DEFAULT 0,
            last_error                  TEXT,
            last_file_change_iteration  INTEGER NOT NULL DEFAULT 0,
            last_activity_unix_ms       INTEGER NOT NULL DEFAULT 0,
            worktree_path               TEXT,
            originating_phase           TEXT NOT NULL,
            review_status               INTEGER,
            last_review_id              TEXT,
            revision_attempts           INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (run_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_loops_run ON loops(run_id);

        CREATE TABLE IF NOT EXISTS context (
            id          TEXT PRIMARY KEY,
            run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL,
            entry_type  TEXT NOT NULL,
            content     TEXT NOT NULL,
            task_id     TEXT,
            loop_id     TEXT,
            file        TEXT,
            line        INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_context_run_type ON context(run_id, entry_type);
        CREATE INDEX IF NOT EXISTS idx_context_run_task ON context(run_id, task_id);
        CREATE INDEX IF NOT EXISTS idx_context_run_loop ON context(run_id, loop_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS context_fts USING fts5(
            content, content='context', content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS context_ai AFTER INSERT ON context BEGIN
            INSERT INTO context_fts(rowid, content) VALUES (new.rowid, new.content);
        END;
        CREATE TRIGGER IF NOT EXISTS context_ad AFTER DELETE ON context BEGIN
            INSERT INTO context_fts(context_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
        END;
        "#,
    )
    .map_err(StoreError::Database)?;
    Ok(())
}
