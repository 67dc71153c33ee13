//! Loop Scheduler / build engine (spec §4.3).
//!
//! Generalizes the donor's `dag/scheduler.rs` `DagScheduler` (wave
//! computation over *phases*) to wave computation over *tasks*, with
//! one worker loop per task (or small group) instead of one process
//! per phase. The "one concurrent agent task per active loop, all
//! awaited together" model (spec §5) is implemented with a
//! `tokio::task::JoinSet` rather than a thread per loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use uuid::Uuid;

use crate::agent::{AgentCall, AgentRuntime};
use crate::callbacks::Callbacks;
use crate::errors::SqResult;
use crate::markers;
use crate::model::{LoopState, LoopStatus, PendingConflict, Phase, Task, TaskGraph, TaskStatus};
use crate::prompts::{build_prompt_with_feedback, BuildPromptInput};
use crate::store::RunStore;
use crate::stuck::{detect_stuck, update_stuck_indicators, StuckReason, StuckThresholds};
use crate::worktree::{MergeOutcome, WorktreeManager};

pub struct BuildStepOutcome {
    pub any_stuck: bool,
    pub any_conflict: bool,
    pub all_tasks_completed: bool,
    pub needs_checkpoint_review: bool,
}

pub struct LoopScheduler {
    pub store: Arc<RunStore>,
    pub worktrees: Arc<WorktreeManager>,
    pub agent: Arc<AgentRuntime>,
    pub max_loops: usize,
    pub max_turns_per_iteration: u32,
    pub model: String,
    pub thresholds: StuckThresholds,
}

impl LoopScheduler {
    /// One invocation of the algorithm in spec §4.3.
    pub async fn step(
        &self,
        run_id: &str,
        task_graph: &TaskGraph,
        callbacks: Arc<dyn Callbacks>,
    ) -> SqResult<BuildStepOutcome> {
        let tasks = self.store.load_tasks(run_id)?;
        let mut loops = self.store.load_loops(run_id)?;

        let active_group = Self::active_group(task_graph, &tasks);
        let Some(active_group) = active_group else {
            return Ok(BuildStepOutcome { any_stuck: false, any_conflict: false, all_tasks_completed: true, needs_checkpoint_review: false });
        };

        self.ensure_loops_for_group(run_id, &active_group, &tasks, &mut loops, callbacks.as_ref()).await?;

        let active_loop_ids: Vec<String> = loops
            .iter()
            .filter(|l| matches!(l.status, LoopStatus::Pending | LoopStatus::Running))
            .map(|l| l.id.clone())
            .collect();

        let mut join_set = tokio::task::JoinSet::new();
        for loop_id in &active_loop_ids {
            let loop_state = loops.iter().find(|l| &l.id == loop_id).unwrap().clone_for_iteration();
            let task = tasks.iter().find(|t| loop_state.task_ids.contains(&t.id)).cloned();
            let Some(task) = task else { continue };
            let store = Arc::clone(&self.store);
            let agent = Arc::clone(&self.agent);
            let worktrees = Arc::clone(&self.worktrees);
            let run_id = run_id.to_string();
            let model = self.model.clone();
            let max_turns = self.max_turns_per_iteration;
            let allowed_tools = vec!["Read".into(), "Edit".into(), "Write".into(), "Bash".into(), "Glob".into(), "Grep".into()];
            let callbacks = Arc::clone(&callbacks);

            join_set.spawn(async move {
                run_one_iteration(store, agent, worktrees, &run_id, loop_state, task, model, max_turns, allowed_tools, callbacks).await
            });
        }

        // Loop state updates are committed to the Run Store in a
        // deterministic order (by loop id), not completion order, so
        // persisted snapshots stay reproducible across replays (spec §5).
        let mut iteration_outcomes: HashMap<String, IterationOutcome> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Ok(outcome)) = joined {
                iteration_outcomes.insert(outcome.loop_id.clone(), outcome);
            }
        }

        let mut any_stuck = false;
        let mut any_conflict = false;
        let mut completed_this_step = Vec::new();

        let mut ordered_ids: Vec<&String> = iteration_outcomes.keys().collect();
        ordered_ids.sort();

        for loop_id in ordered_ids {
            let outcome = &iteration_outcomes[loop_id];
            let loop_state = loops.iter_mut().find(|l| &l.id == loop_id).unwrap();
            loop_state.iteration += 1;
            update_stuck_indicators(&mut loop_state.stuck, outcome.error.as_deref(), outcome.files_changed, loop_state.iteration);
            loop_state.stuck.last_activity_unix_ms = now_ms();
            callbacks.on_loop_output(loop_id, &outcome.output_tail);

            if outcome.task_complete {
                match self.worktrees.merge(run_id, loop_id) {
                    Ok(MergeOutcome::Success) => {
                        for task_id in &loop_state.task_ids {
                            self.store.complete_task(run_id, task_id)?;
                            self.store.set_review_result(run_id, Some(task_id), &[])?;
                        }
                        loop_state.status = LoopStatus::Completed;
                        completed_this_step.extend(loop_state.task_ids.clone());
                    }
                    Ok(MergeOutcome::Conflict { conflict_files }) => {
                        any_conflict = true;
                        let pending = PendingConflict {
                            loop_id: loop_id.clone(),
                            task_id: loop_state.task_ids.first().cloned().unwrap_or_default(),
                            conflict_files,
                        };
                        self.stash_pending_conflict(run_id, pending)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            } else if outcome.task_stuck
                || detect_stuck(&loop_state.stuck, loop_state.iteration, loop_state.max_iterations, &self.thresholds).is_some()
            {
                any_stuck = true;
                loop_state.status = LoopStatus::Stuck;
            } else {
                loop_state.status = LoopStatus::Running;
            }

            self.store.persist_loop_state(run_id, loop_state)?;
            callbacks.on_loop_state_change(loop_id, loop_state.status);
        }

        let needs_checkpoint_review = loops.iter().any(|l| {
            l.status.is_active()
                && l.review_interval > 0
                && l.iteration > l.last_checkpoint_review_at
                && l.iteration % l.review_interval == 0
        });

        let tasks_after = self.store.load_tasks(run_id)?;
        let all_tasks_completed = !tasks_after.is_empty() && tasks_after.iter().all(|t| t.status == TaskStatus::Completed);

        let _ = completed_this_step;
        Ok(BuildStepOutcome { any_stuck, any_conflict, all_tasks_completed, needs_checkpoint_review })
    }

    /// The first parallel group with any task not yet completed.
    fn active_group(graph: &TaskGraph, tasks: &[Task]) -> Option<Vec<String>> {
        let completed: std::collections::HashSet<&str> =
            tasks.iter().filter(|t| t.status == TaskStatus::Completed).map(|t| t.id.as_str()).collect();
        graph.parallel_groups.iter().find(|group| group.iter().any(|id| !completed.contains(id.as_str()))).cloned()
    }

    async fn ensure_loops_for_group(
        &self,
        run_id: &str,
        group: &[String],
        tasks: &[Task],
        loops: &mut Vec<LoopState>,
        callbacks: &dyn Callbacks,
    ) -> SqResult<()> {
        let completed: std::collections::HashSet<&str> =
            tasks.iter().filter(|t| t.status == TaskStatus::Completed).map(|t| t.id.as_str()).collect();

        for task_id in group {
            let task = tasks.iter().find(|t| &t.id == task_id).unwrap();
            if task.assigned_loop.is_some() {
                continue;
            }
            let deps_satisfied = task.dependencies.iter().all(|d| completed.contains(d.as_str()));
            if !deps_satisfied {
                continue;
            }
            let active_count = loops.iter().filter(|l| l.status.is_active()).count();
            if active_count >= self.max_loops {
                break;
            }

            let loop_id = format!("loop-{}", Uuid::new_v4());
            let worktree_path = self.worktrees.create(run_id, &loop_id)?;
            let mut state = LoopState::new(loop_id.clone(), vec![task_id.clone()], task.estimated_iterations.max(1) * 4, 5, Phase::Build);
            state.worktree_path = worktree_path.map(|p| p.to_string_lossy().to_string());
            self.store.persist_loop_state(run_id, &state)?;
            self.store.assign_task_loop(run_id, task_id, &loop_id)?;
            loops.push(state);
            callbacks.on_loop_created(&loop_id, task_id);
        }
        Ok(())
    }

    fn stash_pending_conflict(&self, run_id: &str, conflict: PendingConflict) -> SqResult<()> {
        let mut run = self.store.load_run(run_id)?;
        run.pending_conflicts.push_back(conflict);
        self.store.save_run(&run)
    }
}

struct IterationOutcome {
    loop_id: String,
    output_tail: String,
    files_changed: bool,
    error: Option<String>,
    task_complete: bool,
    task_stuck: bool,
}

impl LoopState {
    fn clone_for_iteration(&self) -> LoopState {
        LoopState {
            id: self.id.clone(),
            task_ids: self.task_ids.clone(),
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            review_interval: self.review_interval,
            last_checkpoint_review_at: self.last_checkpoint_review_at,
            status: self.status,
            stuck: self.stuck.clone(),
            recent_output: crate::model::CircularBuffer::new(200),
            worktree_path: self.worktree_path.clone(),
            originating_phase: self.originating_phase,
            review_status: self.review_status,
            last_review_id: self.last_review_id.clone(),
            revision_attempts: self.revision_attempts,
        }
    }
}

async fn run_one_iteration(
    store: Arc<RunStore>,
    agent: Arc<AgentRuntime>,
    worktrees: Arc<WorktreeManager>,
    run_id: &str,
    loop_state: LoopState,
    task: Task,
    model: String,
    max_turns: u32,
    allowed_tools: Vec<String>,
    callbacks: Arc<dyn Callbacks>,
) -> SqResult<IterationOutcome> {
    let issues = store.load_review_issues(run_id, Some(&task.id))?;
    let scratchpad_filters = crate::store::ContextFilters {
        entry_types: Some(vec![crate::model::ContextType::Scratchpad]),
        task_id: Some(task.id.clone()),
        loop_id: Some(loop_state.id.clone()),
        limit: Some(1),
        ..Default::default()
    };
    let (scratchpad_entries, _) = store.read_context(run_id, &scratchpad_filters)?;
    let scratchpad = scratchpad_entries.first().map(|e| e.content.as_str());
    let prompt = build_prompt_with_feedback(&BuildPromptInput {
        task: &task,
        issues: &issues,
        iteration: loop_state.iteration + 1,
        total_iterations: loop_state.max_iterations,
        scratchpad,
    });

    let cwd = worktrees
        .worktree_path(&loop_state.id)
        .or_else(|| loop_state.worktree_path.as_ref().map(std::path::PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let call = AgentCall { prompt, cwd: cwd.clone(), allowed_tools, max_turns, model };
    let loop_id_for_events = loop_state.id.clone();
    let result = agent
        .run(&call, |event| {
            if let crate::stream::AgentEvent::TextDelta(text) = event {
                if !text.is_empty() {
                    callbacks.on_loop_output(&loop_id_for_events, &text);
                }
            }
        })
        .await;

    let (output, cost_usd, error) = match result {
        Ok(r) => (r.output, r.cost_usd, None),
        Err(e) => (String::new(), 0.0, Some(e.to_string())),
    };

    store.record_cost(run_id, "build", Some(&loop_state.id), cost_usd)?;
    store
        .append_context(
            run_id,
            crate::model::ContextType::Scratchpad,
            output.chars().rev().take(2000).collect::<String>().chars().rev().collect::<String>(),
            Some(task.id.clone()),
            Some(loop_state.id.clone()),
            None,
            None,
        )
        .ok();

    let files_changed = dir_has_uncommitted_changes(&cwd);

    Ok(IterationOutcome {
        loop_id: loop_state.id.clone(),
        output_tail: output.lines().rev().take(5).collect::<Vec<_>>().join("\n"),
        files_changed,
        error,
        task_complete: markers::contains_marker(&output, markers::TASK_COMPLETE),
        task_stuck: markers::contains_marker(&output, markers::TASK_STUCK),
    })
}

fn dir_has_uncommitted_changes(path: &std::path::Path) -> bool {
    git2::Repository::open(path)
        .and_then(|repo| repo.statuses(None))
        .map(|statuses| !statuses.is_empty())
        .unwrap_or(false)
}

fn now_ms() -> i64 {
    let _ = Utc::now();
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task { id: id.to_string(), title: "t".into(), description: "d".into(), status, dependencies: vec![], estimated_iterations: 3, assigned_loop: None }
    }

    #[test]
    fn active_group_is_first_incomplete_group() {
        let graph = TaskGraph { parallel_groups: vec![vec!["a".into()], vec!["b".into()]] };
        let tasks = vec![task("a", TaskStatus::Completed), task("b", TaskStatus::Pending)];
        let group = LoopScheduler::active_group(&graph, &tasks);
        assert_eq!(group, Some(vec!["b".to_string()]));
    }

    #[test]
    fn no_active_group_when_all_complete() {
        let graph = TaskGraph { parallel_groups: vec![vec!["a".into()]] };
        let tasks = vec![task("a", TaskStatus::Completed)];
        assert!(LoopScheduler::active_group(&graph, &tasks).is_none());
    }
}
