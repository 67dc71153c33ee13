//! Loop persistence. Rows are never deleted — loops are destroyed only
//! logically, by status transition, so resume can re-hydrate the exact
//! loop set (spec §3 "Lifecycle & ownership", §4.3 "Restore").

use rusqlite::params;

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::{LoopState, LoopStatus, Phase};

fn status_str(s: LoopStatus) -> &'static str {
    match s {
        LoopStatus::Pending => "pending",
        LoopStatus::Running => "running",
        LoopStatus::Stuck => "stuck",
        LoopStatus::Completed => "completed",
        LoopStatus::Failed => "failed",
        LoopStatus::Interrupted => "interrupted",
    }
}

fn status_from_str(s: &str) -> SqResult<LoopStatus> {
    Ok(match s {
        "pending" => LoopStatus::Pending,
        "running" => LoopStatus::Running,
        "stuck" => LoopStatus::Stuck,
        "completed" => LoopStatus::Completed,
        "failed" => LoopStatus::Failed,
        "interrupted" => LoopStatus::Interrupted,
        other => return Err(StoreError::MalformedArtifact(format!("unknown loop status '{other}'")).into()),
    })
}

fn phase_str(p: Phase) -> &'static str {
    p.as_str()
}

fn phase_from_str(s: &str) -> SqResult<Phase> {
    Ok(match s {
        "analyze" => Phase::Analyze,
        "enumerate" => Phase::Enumerate,
        "plan" => Phase::Plan,
        "build" => Phase::Build,
        "review" => Phase::Review,
        "revise" => Phase::Revise,
        "conflict" => Phase::Conflict,
        "complete" => Phase::Complete,
        other => return Err(StoreError::MalformedArtifact(format!("unknown phase '{other}'")).into()),
    })
}

impl RunStore {
    pub fn persist_loop_state(&self, run_id: &str, state: &LoopState) -> SqResult<()> {
        self.conn
            .execute(
                "INSERT INTO loops (id, run_id, task_ids_json, iteration, max_iterations, review_interval,
                 last_checkpoint_review_at, status, same_error_count, no_progress_count, last_error,
                 last_file_change_iteration, last_activity_unix_ms, worktree_path, originating_phase,
                 review_status, last_review_id, revision_attempts)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                 ON CONFLICT(run_id, id) DO UPDATE SET
                   task_ids_json=excluded.task_ids_json, iteration=excluded.iteration,
                   last_checkpoint_review_at=excluded.last_checkpoint_review_at, status=excluded.status,
                   same_error_count=excluded.same_error_count, no_progress_count=excluded.no_progress_count,
                   last_error=excluded.last_error, last_file_change_iteration=excluded.last_file_change_iteration,
                   last_activity_unix_ms=excluded.last_activity_unix_ms, worktree_path=excluded.worktree_path,
                   review_status=excluded.review_status, last_review_id=excluded.last_review_id,
                   revision_attempts=excluded.revision_attempts",
                params![
                    state.id,
                    run_id,
                    serde_json::to_string(&state.task_ids).unwrap(),
                    state.iteration,
                    state.max_iterations,
                    state.review_interval,
                    state.last_checkpoint_review_at,
                    status_str(state.status),
                    state.stuck.same_error_count,
                    state.stuck.no_progress_count,
                    state.stuck.last_error,
                    state.stuck.last_file_change_iteration,
                    state.stuck.last_activity_unix_ms,
                    state.worktree_path,
                    phase_str(state.originating_phase),
                    state.review_status,
                    state.last_review_id,
                    state.revision_attempts,
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn update_loop_status(&self, run_id: &str, loop_id: &str, status: LoopStatus) -> SqResult<()> {
        self.conn
            .execute(
                "UPDATE loops SET status = ?3 WHERE run_id = ?1 AND id = ?2",
                params![run_id, loop_id, status_str(status)],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Re-hydrates every persisted loop row (spec §4.3 "Restore").
    pub fn load_loops(&self, run_id: &str) -> SqResult<Vec<LoopState>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_ids_json, iteration, max_iterations, review_interval, last_checkpoint_review_at,
                 status, same_error_count, no_progress_count, last_error, last_file_change_iteration,
                 last_activity_unix_ms, worktree_path, originating_phase, review_status, last_review_id,
                 revision_attempts
                 FROM loops WHERE run_id = ?1 ORDER BY id ASC",
            )
            .map_err(StoreError::Database)?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, u32>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, Option<bool>>(14)?,
                    row.get::<_, Option<String>>(15)?,
                    row.get::<_, u32>(16)?,
                ))
            })
            .map_err(StoreError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                task_ids_json,
                iteration,
                max_iterations,
                review_interval,
                last_checkpoint_review_at,
                status,
                same_error_count,
                no_progress_count,
                last_error,
                last_file_change_iteration,
                last_activity_unix_ms,
                worktree_path,
                originating_phase,
                review_status,
                last_review_id,
                revision_attempts,
            ) = row.map_err(StoreError::Database)?;

            out.push(LoopState {
                id,
                task_ids: serde_json::from_str(&task_ids_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
                iteration,
                max_iterations,
                review_interval,
                last_checkpoint_review_at,
                status: status_from_str(&status)?,
                stuck: crate::model::StuckIndicators {
                    same_error_count,
                    no_progress_count,
                    last_error,
                    last_file_change_iteration,
                    last_activity_unix_ms,
                },
                recent_output: crate::model::CircularBuffer::new(200),
                worktree_path,
                originating_phase: phase_from_str(&originating_phase)?,
                review_status,
                last_review_id,
                revision_attempts,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_run() -> RunStore {
        let store = RunStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO runs (id, spec_path, effort, phase, config_json, revision_count,
                 per_run_max_usd, per_phase_max_usd, per_loop_max_usd, created_at)
                 VALUES ('r1','spec.md','medium','analyze','{}',0,5.0,2.0,1.0, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        store
    }

    #[test]
    fn persist_then_restore_preserves_counters() {
        let store = store_with_run();
        let mut state = LoopState::new("loop-1".into(), vec!["t1".into()], 20, 5, Phase::Build);
        state.iteration = 7;
        state.stuck.same_error_count = 2;
        state.worktree_path = Some("/tmp/wt/loop-1".into());
        store.persist_loop_state("r1", &state).unwrap();

        let loaded = store.load_loops("r1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].iteration, 7);
        assert_eq!(loaded[0].stuck.same_error_count, 2);
        assert_eq!(loaded[0].worktree_path.as_deref(), Some("/tmp/wt/loop-1"));
    }

    #[test]
    fn update_status_transition() {
        let store = store_with_run();
        let state = LoopState::new("loop-1".into(), vec!["t1".into()], 20, 5, Phase::Build);
        store.persist_loop_state("r1", &state).unwrap();
        store.update_loop_status("r1", "loop-1", LoopStatus::Completed).unwrap();
        let loaded = store.load_loops("r1").unwrap();
        assert_eq!(loaded[0].status, LoopStatus::Completed);
    }
}
