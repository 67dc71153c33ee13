//! Stuck-loop detection (spec §4.3 step 4, §8 fixture 6).

use crate::model::StuckIndicators;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    RepeatedError,
    NoProgress,
    MaxIterations,
}

pub struct StuckThresholds {
    pub same_error: u32,
    pub no_progress: u32,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        StuckThresholds { same_error: 3, no_progress: 3 }
    }
}

/// Returns the first-triggered reason, checked in the order the spec
/// lists them: repeated error, no progress, max iterations.
pub fn detect_stuck(
    stuck: &StuckIndicators,
    iteration: u32,
    max_iterations: u32,
    thresholds: &StuckThresholds,
) -> Option<StuckReason> {
    if stuck.same_error_count >= thresholds.same_error {
        return Some(StuckReason::RepeatedError);
    }
    if stuck.no_progress_count >= thresholds.no_progress {
        return Some(StuckReason::NoProgress);
    }
    if iteration > max_iterations {
        return Some(StuckReason::MaxIterations);
    }
    None
}

/// Updates same-error/no-progress counters after one iteration (spec
/// §4.3 step 3e).
pub fn update_stuck_indicators(
    stuck: &mut StuckIndicators,
    error: Option<&str>,
    files_changed: bool,
    iteration: u32,
) {
    match error {
        Some(e) if stuck.last_error.as_deref() == Some(e) => stuck.same_error_count += 1,
        Some(e) => {
            stuck.last_error = Some(e.to_string());
            stuck.same_error_count = 1;
        }
        None => {
            stuck.last_error = None;
            stuck.same_error_count = 0;
        }
    }

    if files_changed {
        stuck.no_progress_count = 0;
        stuck.last_file_change_iteration = iteration;
    } else {
        stuck.no_progress_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_error_fixture() {
        let stuck = StuckIndicators { same_error_count: 4, ..Default::default() };
        let reason = detect_stuck(&stuck, 1, 20, &StuckThresholds::default());
        assert_eq!(reason, Some(StuckReason::RepeatedError));
    }

    #[test]
    fn max_iterations_fixture() {
        let stuck = StuckIndicators::default();
        let reason = detect_stuck(&stuck, 21, 20, &StuckThresholds::default());
        assert_eq!(reason, Some(StuckReason::MaxIterations));
    }

    #[test]
    fn not_stuck_under_all_thresholds() {
        let stuck = StuckIndicators::default();
        assert_eq!(detect_stuck(&stuck, 5, 20, &StuckThresholds::default()), None);
    }

    #[test]
    fn indicators_reset_on_progress() {
        let mut stuck = StuckIndicators { no_progress_count: 2, same_error_count: 2, last_error: Some("boom".into()), ..Default::default() };
        update_stuck_indicators(&mut stuck, None, true, 5);
        assert_eq!(stuck.no_progress_count, 0);
        assert_eq!(stuck.same_error_count, 0);
        assert_eq!(stuck.last_file_change_iteration, 5);
    }

    #[test]
    fn same_error_increments_count() {
        let mut stuck = StuckIndicators::default();
        update_stuck_indicators(&mut stuck, Some("boom"), false, 1);
        update_stuck_indicators(&mut stuck, Some("boom"), false, 2);
        assert_eq!(stuck.same_error_count, 2);
        assert_eq!(stuck.no_progress_count, 2);
    }
}
