//! Cost tallies. Updated before every limit check (spec §4.2 cross-
//! cutting rule: "each non-trivial phase invocation updates per-phase
//! and per-loop cost tallies before checking limits for the next call").

use rusqlite::params;

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::CostTracking;

impl RunStore {
    pub fn record_cost(&self, run_id: &str, phase: &str, loop_id: Option<&str>, delta_usd: f64) -> SqResult<()> {
        let mut costs = self.load_costs(run_id)?;
        costs.total_usd += delta_usd;
        *costs.per_phase_usd.entry(phase.to_string()).or_insert(0.0) += delta_usd;
        if let Some(loop_id) = loop_id {
            *costs.per_loop_usd.entry(loop_id.to_string()).or_insert(0.0) += delta_usd;
        }
        self.conn
            .execute(
                "UPDATE runs SET total_cost_usd = ?2, per_phase_cost_json = ?3, per_loop_cost_json = ?4 WHERE id = ?1",
                params![
                    run_id,
                    costs.total_usd,
                    serde_json::to_string(&costs.per_phase_usd).unwrap(),
                    serde_json::to_string(&costs.per_loop_usd).unwrap(),
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn record_phase_cost(&self, run_id: &str, phase: &str, delta_usd: f64) -> SqResult<()> {
        self.record_cost(run_id, phase, None, delta_usd)
    }

    pub fn load_costs(&self, run_id: &str) -> SqResult<CostTracking> {
        let (total, per_phase_json, per_loop_json): (f64, String, String) = self
            .conn
            .query_row(
                "SELECT total_cost_usd, per_phase_cost_json, per_loop_cost_json FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(StoreError::Database)?;
        Ok(CostTracking {
            total_usd: total,
            per_phase_usd: serde_json::from_str(&per_phase_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
            per_loop_usd: serde_json::from_str(&per_loop_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
        })
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
    fn cost_accumulates_by_phase_and_loop() {
        let store = store_with_run();
        store.record_cost("r1", "build", Some("loop-1"), 1.5).unwrap();
        store.record_cost("r1", "build", Some("loop-1"), 0.5).unwrap();
        store.record_cost("r1", "build", Some("loop-2"), 1.0).unwrap();

        let costs = store.load_costs("r1").unwrap();
        assert_eq!(costs.total_usd, 3.0);
        assert_eq!(costs.per_phase_usd["build"], 3.0);
        assert_eq!(costs.per_loop_usd["loop-1"], 2.0);
        assert_eq!(costs.per_loop_usd["loop-2"], 1.0);
    }

    #[test]
    fn sum_invariant_holds_within_tolerance() {
        let store = store_with_run();
        store.record_cost("r1", "build", Some("loop-1"), 2.0).unwrap();
        store.record_cost("r1", "enumerate", None, 1.0).unwrap();

        let costs = store.load_costs("r1").unwrap();
        let phase_sum: f64 = costs.per_phase_usd.values().sum();
        assert!((costs.total_usd - phase_sum).abs() < 1e-6);
    }
}
