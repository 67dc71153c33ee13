//! Cost & Limit Enforcer (spec §4.7).

use crate::model::{CostLimits, CostTracking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Run,
    Phase,
    Loop,
}

#[derive(Debug, Clone)]
pub struct LimitCheck {
    pub exceeded: bool,
    pub kind: Option<LimitKind>,
    pub current: f64,
    pub limit: f64,
    pub phase: Option<String>,
    pub loop_id: Option<String>,
}

impl LimitCheck {
    fn ok() -> Self {
        LimitCheck { exceeded: false, kind: None, current: 0.0, limit: 0.0, phase: None, loop_id: None }
    }

    /// `"Run cost limit exceeded: $5.50 ≥ $5.00"`-style message (spec
    /// §4.7).
    pub fn message(&self) -> String {
        if !self.exceeded {
            return "cost limit not exceeded".to_string();
        }
        match self.kind {
            Some(LimitKind::Run) => format!("Run cost limit exceeded: ${:.2} \u{2265} ${:.2}", self.current, self.limit),
            Some(LimitKind::Phase) => format!(
                "Phase '{}' cost limit exceeded: ${:.2} \u{2265} ${:.2}",
                self.phase.as_deref().unwrap_or("?"),
                self.current,
                self.limit
            ),
            Some(LimitKind::Loop) => format!(
                "Loop '{}' cost limit exceeded: ${:.2} \u{2265} ${:.2}",
                self.loop_id.as_deref().unwrap_or("?"),
                self.current,
                self.limit
            ),
            None => "cost limit not exceeded".to_string(),
        }
    }
}

/// Checks all limits in priority order: run -> phase -> loops in
/// iteration order. Comparison is non-strict (`current >= limit`).
pub fn check_all_cost_limits(
    costs: &CostTracking,
    limits: &CostLimits,
    active_phase: &str,
    active_loops: &[String],
) -> LimitCheck {
    if costs.total_usd >= limits.per_run_max_usd {
        return LimitCheck {
            exceeded: true,
            kind: Some(LimitKind::Run),
            current: costs.total_usd,
            limit: limits.per_run_max_usd,
            phase: None,
            loop_id: None,
        };
    }

    let phase_cost = costs.per_phase_usd.get(active_phase).copied().unwrap_or(0.0);
    if phase_cost >= limits.per_phase_max_usd {
        return LimitCheck {
            exceeded: true,
            kind: Some(LimitKind::Phase),
            current: phase_cost,
            limit: limits.per_phase_max_usd,
            phase: Some(active_phase.to_string()),
            loop_id: None,
        };
    }

    for loop_id in active_loops {
        let loop_cost = costs.per_loop_usd.get(loop_id).copied().unwrap_or(0.0);
        if loop_cost >= limits.per_loop_max_usd {
            return LimitCheck {
                exceeded: true,
                kind: Some(LimitKind::Loop),
                current: loop_cost,
                limit: limits.per_loop_max_usd,
                phase: None,
                loop_id: Some(loop_id.clone()),
            };
        }
    }

    LimitCheck::ok()
}
