//! Run CRUD: create/load/save the top-level `Run` row.

use std::collections::VecDeque;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::{
    CodebaseAnalysis, CostLimits, CostTracking, PendingConflict, Phase, Run, RunConfigSnapshot, ReviewType,
};

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

fn review_type_str(r: ReviewType) -> &'static str {
    match r {
        ReviewType::Enumerate => "enumerate",
        ReviewType::Plan => "plan",
        ReviewType::Build => "build",
    }
}

fn review_type_from_str(s: &str) -> SqResult<ReviewType> {
    Ok(match s {
        "enumerate" => ReviewType::Enumerate,
        "plan" => ReviewType::Plan,
        "build" => ReviewType::Build,
        other => return Err(StoreError::MalformedArtifact(format!("unknown review type '{other}'")).into()),
    })
}

impl RunStore {
    pub fn create_run(&self, run: &Run) -> SqResult<()> {
        let config_json = serde_json::to_string(&run.config).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
        let analysis_json = run
            .codebase_analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
        let conflicts_json = serde_json::to_string(&run.pending_conflicts.iter().collect::<Vec<_>>())
            .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO runs (id, spec_path, effort, phase, config_json, codebase_analysis_json,
                 was_empty_project, pending_review, revision_count, pending_conflicts_json,
                 total_cost_usd, per_phase_cost_json, per_loop_cost_json,
                 per_run_max_usd, per_phase_max_usd, per_loop_max_usd, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                params![
                    run.id,
                    run.spec_path,
                    serde_json::to_string(&run.effort).unwrap(),
                    phase_str(run.phase),
                    config_json,
                    analysis_json,
                    run.was_empty_project,
                    run.pending_review.map(review_type_str),
                    run.revision_count,
                    conflicts_json,
                    run.costs.total_usd,
                    serde_json::to_string(&run.costs.per_phase_usd).unwrap(),
                    serde_json::to_string(&run.costs.per_loop_usd).unwrap(),
                    run.cost_limits.per_run_max_usd,
                    run.cost_limits.per_phase_max_usd,
                    run.cost_limits.per_loop_max_usd,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn save_run(&self, run: &Run) -> SqResult<()> {
        let config_json = serde_json::to_string(&run.config).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
        let analysis_json = run
            .codebase_analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
        let conflicts_json = serde_json::to_string(&run.pending_conflicts.iter().collect::<Vec<_>>())
            .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;

        let rows = self
            .conn
            .execute(
                "UPDATE runs SET phase=?2, config_json=?3, codebase_analysis_json=?4, was_empty_project=?5,
                 pending_review=?6, revision_count=?7, pending_conflicts_json=?8, total_cost_usd=?9,
                 per_phase_cost_json=?10, per_loop_cost_json=?11
                 WHERE id=?1",
                params![
                    run.id,
                    phase_str(run.phase),
                    config_json,
                    analysis_json,
                    run.was_empty_project,
                    run.pending_review.map(review_type_str),
                    run.revision_count,
                    conflicts_json,
                    run.costs.total_usd,
                    serde_json::to_string(&run.costs.per_phase_usd).unwrap(),
                    serde_json::to_string(&run.costs.per_loop_usd).unwrap(),
                ],
            )
            .map_err(StoreError::Database)?;
        if rows == 0 {
            return Err(StoreError::RunNotFound(run.id.clone()).into());
        }
        Ok(())
    }

    /// Appends one phase-history row. Separate from [`RunStore::save_run`]
    /// so re-persisting an already-loaded `Run` (round-trip idempotence,
    /// spec §8) never re-inserts history that came from the database in
    /// the first place — the driver calls this exactly once per phase
    /// completion, before `save_run` persists the rest of the state.
    pub fn append_phase_history(&self, run_id: &str, entry: &crate::model::PhaseHistoryEntry) -> SqResult<()> {
        self.conn
            .execute(
                "INSERT INTO phase_history (run_id, phase, success, summary, cost_usd, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    run_id,
                    phase_str(entry.phase),
                    entry.success,
                    entry.summary,
                    entry.cost_usd,
                    entry.timestamp.to_rfc3339(),
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> SqResult<Run> {
        let row = self
            .conn
            .query_row(
                "SELECT spec_path, effort, phase, config_json, codebase_analysis_json, was_empty_project,
                 pending_review, revision_count, pending_conflicts_json, total_cost_usd, per_phase_cost_json,
                 per_loop_cost_json, per_run_max_usd, per_phase_max_usd, per_loop_max_usd
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<bool>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, f64>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, f64>(12)?,
                        row.get::<_, f64>(13)?,
                        row.get::<_, f64>(14)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::Database)?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        let (
            spec_path,
            effort,
            phase,
            config_json,
            analysis_json,
            was_empty_project,
            pending_review,
            revision_count,
            conflicts_json,
            total_usd,
            per_phase_json,
            per_loop_json,
            per_run_max,
            per_phase_max,
            per_loop_max,
        ) = row;

        let phase_history = self.load_phase_history(run_id)?;

        let raw_conflicts: Vec<PendingConflict> =
            serde_json::from_str(&conflicts_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;

        Ok(Run {
            id: run_id.to_string(),
            spec_path,
            effort: serde_json::from_str(&effort).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
            phase: phase_from_str(&phase)?,
            phase_history,
            config: serde_json::from_str::<RunConfigSnapshot>(&config_json)
                .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
            codebase_analysis: analysis_json
                .map(|s| serde_json::from_str::<CodebaseAnalysis>(&s))
                .transpose()
                .map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
            was_empty_project,
            pending_review: pending_review.map(|s| review_type_from_str(&s)).transpose()?,
            revision_count,
            pending_conflicts: VecDeque::from(raw_conflicts),
            costs: CostTracking {
                total_usd,
                per_phase_usd: serde_json::from_str(&per_phase_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
                per_loop_usd: serde_json::from_str(&per_loop_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
            },
            cost_limits: CostLimits {
                per_run_max_usd: per_run_max,
                per_phase_max_usd: per_phase_max,
                per_loop_max_usd: per_loop_max,
            },
        })
    }

    /// Id of the most recently created run, if any. The driver's
    /// `--resume` flag has no run id of its own to go on (spec §4.1
    /// takes only a state directory), so resuming means "the last run
    /// this state directory ever held."
    pub fn latest_run_id(&self) -> SqResult<Option<String>> {
        self.conn
            .query_row("SELECT id FROM runs ORDER BY created_at DESC LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(StoreError::Database)
    }

    fn load_phase_history(&self, run_id: &str) -> SqResult<Vec<crate::model::PhaseHistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT phase, success, summary, cost_usd, created_at FROM phase_history WHERE run_id = ?1 ORDER BY id ASC")
            .map_err(StoreError::Database)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(StoreError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            let (phase, success, summary, cost_usd, created_at) = row.map_err(StoreError::Database)?;
            out.push(crate::model::PhaseHistoryEntry {
                phase: phase_from_str(&phase)?,
                success,
                summary,
                cost_usd,
                timestamp: created_at.parse().map_err(|_| StoreError::MalformedArtifact("bad timestamp".into()))?,
            });
        }
        Ok(out)
    }
}
