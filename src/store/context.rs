//! The context log: unified append-only store of agent-produced
//! observations (spec §3, §4.6, §9 "Context log as single source of
//! truth").

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::{ContextEntry, ContextType};

fn type_str(t: ContextType) -> &'static str {
    match t {
        ContextType::Discovery => "discovery",
        ContextType::Error => "error",
        ContextType::Decision => "decision",
        ContextType::ReviewIssue => "review_issue",
        ContextType::CodebaseAnalysis => "codebase_analysis",
        ContextType::Scratchpad => "scratchpad",
    }
}

fn type_from_str(s: &str) -> SqResult<ContextType> {
    Ok(match s {
        "discovery" => ContextType::Discovery,
        "error" => ContextType::Error,
        "decision" => ContextType::Decision,
        "review_issue" => ContextType::ReviewIssue,
        "codebase_analysis" => ContextType::CodebaseAnalysis,
        "scratchpad" => ContextType::Scratchpad,
        other => return Err(StoreError::MalformedArtifact(format!("unknown context type '{other}'")).into()),
    })
}

#[derive(Debug, Default, Clone)]
pub struct ContextFilters {
    pub entry_types: Option<Vec<ContextType>>,
    pub task_id: Option<String>,
    pub loop_id: Option<String>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl RunStore {
    /// Append one entry. Atomic (single INSERT) and idempotent for
    /// retries when the caller supplies the same `id` (primary key
    /// conflict is a silent no-op via `INSERT OR IGNORE`).
    pub fn write_context(&self, run_id: &str, entry: &ContextEntry) -> SqResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO context
                 (id, run_id, created_at, entry_type, content, task_id, loop_id, file, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id,
                    run_id,
                    entry.created_at.to_rfc3339(),
                    type_str(entry.entry_type),
                    entry.content,
                    entry.task_id,
                    entry.loop_id,
                    entry.file,
                    entry.line,
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn append_context(
        &self,
        run_id: &str,
        entry_type: ContextType,
        content: impl Into<String>,
        task_id: Option<String>,
        loop_id: Option<String>,
        file: Option<String>,
        line: Option<u32>,
    ) -> SqResult<ContextEntry> {
        let entry = ContextEntry {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            entry_type,
            content: content.into(),
            task_id,
            loop_id,
            file,
            line,
        };
        self.write_context(run_id, &entry)?;
        Ok(entry)
    }

    pub fn read_context(&self, run_id: &str, filters: &ContextFilters) -> SqResult<(Vec<ContextEntry>, u64)> {
        let mut sql = String::from(
            "SELECT id, run_id, created_at, entry_type, content, task_id, loop_id, file, line FROM context WHERE run_id = ?1",
        );
        let mut count_sql = String::from("SELECT COUNT(*) FROM context WHERE run_id = ?1");
        let mut bind_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(run_id.to_string())];

        if let Some(search) = &filters.search {
            let clause = " AND id IN (SELECT context.id FROM context JOIN context_fts ON context.rowid = context_fts.rowid WHERE context_fts MATCH ?)";
            sql.push_str(clause);
            count_sql.push_str(clause);
            bind_params.push(Box::new(search.clone()));
        }
        if let Some(types) = &filters.entry_types {
            let placeholders = vec!["?"; types.len()].join(",");
            let clause = format!(" AND entry_type IN ({placeholders})");
            sql.push_str(&clause);
            count_sql.push_str(&clause);
            for t in types {
                bind_params.push(Box::new(type_str(*t).to_string()));
            }
        }
        if let Some(task_id) = &filters.task_id {
            let clause = " AND task_id = ?";
            sql.push_str(clause);
            count_sql.push_str(clause);
            bind_params.push(Box::new(task_id.clone()));
        }
        if let Some(loop_id) = &filters.loop_id {
            let clause = " AND loop_id = ?";
            sql.push_str(clause);
            count_sql.push_str(clause);
            bind_params.push(Box::new(loop_id.clone()));
        }

        let count_params = rusqlite::params_from_iter(bind_params.iter());
        let total: i64 =
            self.conn.query_row(&count_sql, count_params, |row| row.get(0)).map_err(StoreError::Database)?;

        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filters.limit {
            sql.push_str(" LIMIT ?");
            bind_params.push(Box::new(limit));
            if let Some(offset) = filters.offset {
                sql.push_str(" OFFSET ?");
                bind_params.push(Box::new(offset));
            }
        }

        let mut stmt = self.conn.prepare(&sql).map_err(StoreError::Database)?;
        let select_params = rusqlite::params_from_iter(bind_params.iter());
        let rows = stmt
            .query_map(select_params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<u32>>(8)?,
                ))
            })
            .map_err(StoreError::Database)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, run_id, created_at, entry_type, content, task_id, loop_id, file, line) =
                row.map_err(StoreError::Database)?;
            entries.push(ContextEntry {
                id,
                run_id,
                created_at: created_at
                    .parse()
                    .map_err(|_| StoreError::MalformedArtifact("bad created_at timestamp".into()))?,
                entry_type: type_from_str(&entry_type)?,
                content,
                task_id,
                loop_id,
                file,
                line,
            });
        }
        Ok((entries, total as u64))
    }

    /// For each type except `codebase_analysis`, keep only the most
    /// recent `max_per_type` rows.
    pub fn prune_context(&self, run_id: &str, max_per_type: u32) -> SqResult<()> {
        let types = [
            ContextType::Discovery,
            ContextType::Error,
            ContextType::Decision,
            ContextType::ReviewIssue,
            ContextType::Scratchpad,
        ];
        for t in types {
            self.conn
                .execute(
                    "DELETE FROM context WHERE run_id = ?1 AND entry_type = ?2
                     AND id NOT IN (
                        SELECT id FROM context WHERE run_id = ?1 AND entry_type = ?2
                        ORDER BY created_at DESC LIMIT ?3
                     )",
                    params![run_id, type_str(t), max_per_type],
                )
                .map_err(StoreError::Database)?;
        }
        Ok(())
    }
}
