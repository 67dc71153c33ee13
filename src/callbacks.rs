//! External callbacks (spec §2 "External callbacks", §6 "terminal UI
//! ... covered only as an event consumer of orchestrator callbacks").
//!
//! `Callbacks` is the narrow observer interface the driver and the
//! Loop Scheduler push events through; it is the only thing the UI
//! touches. Generalizes the donor's `ui::OrchestratorUI` (a single
//! phase/iteration/file progress-bar trio) into a trait with one
//! implementation per presentation mode: a `TuiCallbacks` (one
//! `indicatif` bar per loop, grounded in the donor's
//! `ui/dag_progress.rs` per-lane bar idiom) and a `PlainTextCallbacks`
//! for `--no-tui` that just writes styled lines to stdout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::model::{LoopStatus, Phase};

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "* ");

/// Observer interface consumed by the driver (phase events) and the
/// Loop Scheduler (loop events). Implementors must be safe to call
/// from the scheduler's concurrent iteration loop (spec §5) — plain
/// `&self` methods, no interior mutation that isn't itself `Sync`.
pub trait Callbacks: Send + Sync {
    fn on_phase_start(&self, phase: Phase);
    fn on_phase_complete(&self, phase: Phase, success: bool, summary: &str);
    fn on_output(&self, chunk: &str);
    fn on_loop_output(&self, loop_id: &str, chunk: &str);
    fn on_loop_state_change(&self, loop_id: &str, status: LoopStatus);
    fn on_loop_created(&self, loop_id: &str, task_id: &str);
}

/// Discards every event. Used by library callers and tests that don't
/// want terminal output.
pub struct NullCallbacks;

impl Callbacks for NullCallbacks {
    fn on_phase_start(&self, _phase: Phase) {}
    fn on_phase_complete(&self, _phase: Phase, _success: bool, _summary: &str) {}
    fn on_output(&self, _chunk: &str) {}
    fn on_loop_output(&self, _loop_id: &str, _chunk: &str) {}
    fn on_loop_state_change(&self, _loop_id: &str, _status: LoopStatus) {}
    fn on_loop_created(&self, _loop_id: &str, _task_id: &str) {}
}

/// `--no-tui`: plain styled stdout lines, no progress bars. Matches
/// the donor's fallback text path for non-interactive terminals.
pub struct PlainTextCallbacks;

impl Callbacks for PlainTextCallbacks {
    fn on_phase_start(&self, phase: Phase) {
        println!("{} {}", style("▶").cyan().bold(), style(phase.as_str()).bold());
    }

    fn on_phase_complete(&self, phase: Phase, success: bool, summary: &str) {
        let icon = if success { CHECK.to_string() } else { CROSS.to_string() };
        println!("{icon}{}: {summary}", phase.as_str());
    }

    fn on_output(&self, chunk: &str) {
        for line in chunk.lines() {
            println!("  {}", style(line).dim());
        }
    }

    fn on_loop_output(&self, loop_id: &str, chunk: &str) {
        for line in chunk.lines() {
            println!("  [{}] {}", style(loop_id).magenta(), line);
        }
    }

    fn on_loop_state_change(&self, loop_id: &str, status: LoopStatus) {
        println!("  [{}] -> {:?}", style(loop_id).magenta(), status);
    }

    fn on_loop_created(&self, loop_id: &str, task_id: &str) {
        println!("  {}loop {} assigned to task {}", GEAR, loop_id, task_id);
    }
}

/// Full terminal UI: one phase bar plus one spinner lane per active
/// loop, added/removed from the `MultiProgress` as loops come and go.
pub struct TuiCallbacks {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    loop_bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TuiCallbacks {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap();
        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phase");
        phase_bar.enable_steady_tick(Duration::from_millis(100));

        TuiCallbacks { multi, phase_bar, loop_bars: Mutex::new(HashMap::new()) }
    }

    fn loop_bar(&self, loop_id: &str) -> ProgressBar {
        let mut bars = self.loop_bars.lock().unwrap();
        bars.entry(loop_id.to_string())
            .or_insert_with(|| {
                let style = ProgressStyle::default_spinner()
                    .template("{prefix:.bold.dim} {spinner} {msg}")
                    .unwrap();
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(style);
                bar.set_prefix(format!("  {loop_id}"));
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            })
            .clone()
    }
}

impl Default for TuiCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks for TuiCallbacks {
    fn on_phase_start(&self, phase: Phase) {
        self.phase_bar.set_message(style(phase.as_str()).yellow().to_string());
    }

    fn on_phase_complete(&self, phase: Phase, success: bool, summary: &str) {
        let icon = if success { &CHECK } else { &CROSS };
        self.multi.println(format!("{icon}{}: {summary}", phase.as_str())).ok();
    }

    fn on_output(&self, chunk: &str) {
        if let Some(last) = chunk.lines().last() {
            self.phase_bar.set_message(style(last).dim().to_string());
        }
    }

    fn on_loop_output(&self, loop_id: &str, chunk: &str) {
        let bar = self.loop_bar(loop_id);
        if let Some(last) = chunk.lines().last() {
            bar.set_message(last.to_string());
        }
    }

    fn on_loop_state_change(&self, loop_id: &str, status: LoopStatus) {
        let bar = self.loop_bar(loop_id);
        bar.set_message(format!("{status:?}"));
        if status.is_terminal() {
            bar.finish();
        }
    }

    fn on_loop_created(&self, loop_id: &str, task_id: &str) {
        let bar = self.loop_bar(loop_id);
        bar.set_message(format!("assigned to {task_id}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_callbacks_accept_every_event_without_panicking() {
        let cb = NullCallbacks;
        cb.on_phase_start(Phase::Analyze);
        cb.on_phase_complete(Phase::Analyze, true, "ok");
        cb.on_output("hello");
        cb.on_loop_output("loop-1", "working");
        cb.on_loop_state_change("loop-1", LoopStatus::Running);
        cb.on_loop_created("loop-1", "t1");
    }
}
