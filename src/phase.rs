//! Phase Engine (spec §4.2): the state machine over
//! `{ analyze, enumerate, plan, build, review, revise, conflict, complete }`.
//!
//! Generalizes the donor's module-doc split (Builder/Scheduler/Executor,
//! `dag/mod.rs`) and `main.rs`'s `run_orchestrator` phase loop into the
//! tagged-variant dispatch spec §9 asks for: one `step` function
//! matching on `run.phase`, each arm owning exactly the transition
//! rules in spec §4.2's table. Incompleteness, stuck loops, and merge
//! conflicts are reported as `PhaseResult { success: false, .. }` data,
//! not `Err` — per spec §7's propagation policy, only storage/schema
//! errors are fatal.

use std::path::Path;
use std::sync::Arc;

use crate::agent::{AgentCall, AgentRuntime};
use crate::callbacks::Callbacks;
use crate::effort::EffortProfile;
use crate::errors::{PhaseError, SqResult};
use crate::markers;
use crate::model::{
    CodebaseAnalysis, ContextType, LoopStatus, PendingConflict, Phase, ReviewType, Run, Task, TaskGraph, TaskStatus,
};
use crate::prompts;
use crate::scheduler::LoopScheduler;
use crate::store::RunStore;
use crate::stream::AgentEvent;
use crate::worktree::{MergeOutcome, WorktreeManager};

/// Dependencies threaded through every phase call (spec §9 "Mutable
/// global agent-runtime singleton ⇒ explicit dependency").
pub struct PhaseContext {
    pub store: Arc<RunStore>,
    pub agent: Arc<AgentRuntime>,
    pub worktrees: Arc<WorktreeManager>,
    pub scheduler: Arc<LoopScheduler>,
    pub callbacks: Arc<dyn Callbacks>,
    pub project_dir: std::path::PathBuf,
    pub spec_text: String,
    pub model: String,
    pub max_turns: u32,
}

/// One phase invocation's result, recorded verbatim to phase history.
pub struct PhaseResult {
    pub next_phase: Phase,
    pub success: bool,
    pub summary: String,
    pub cost_usd: f64,
}

/// One step of the phase state machine (spec §4.2's transition table).
pub async fn step(run: &mut Run, ctx: &PhaseContext) -> SqResult<PhaseResult> {
    let profile = run.effort.profile();
    match run.phase {
        Phase::Analyze => analyze(run, ctx).await,
        Phase::Enumerate => enumerate(run, ctx, &profile).await,
        Phase::Plan => plan(run, ctx, &profile).await,
        Phase::Build => build(run, ctx).await,
        Phase::Review => review(run, ctx).await,
        Phase::Revise => revise(run, ctx, &profile).await,
        Phase::Conflict => conflict(run, ctx).await,
        Phase::Complete => {
            Ok(PhaseResult { next_phase: Phase::Complete, success: true, summary: "already complete".into(), cost_usd: 0.0 })
        }
    }
}

fn forward(ctx: &PhaseContext) -> impl FnMut(AgentEvent) + '_ {
    move |event| {
        if let AgentEvent::TextDelta(text) = event {
            if !text.is_empty() {
                ctx.callbacks.on_output(&text);
            }
        }
    }
}

/// §4.2.1 analyze
async fn analyze(run: &mut Run, ctx: &PhaseContext) -> SqResult<PhaseResult> {
    // `was_empty_project` is latched once at run init (spec §4.1 step 1);
    // fall back to a live check only if a pre-latch run is missing it.
    let is_empty = run.was_empty_project.unwrap_or_else(|| crate::agent::is_empty_project(&ctx.project_dir));
    if is_empty {
        let analysis = CodebaseAnalysis::empty_project();
        let json = serde_json::to_string(&analysis).map_err(|e| crate::errors::StoreError::MalformedArtifact(e.to_string()))?;
        ctx.store.set_codebase_analysis(&run.id, &json)?;
        run.codebase_analysis = Some(analysis);
        run.was_empty_project = Some(true);
        return Ok(PhaseResult {
            next_phase: Phase::Enumerate,
            success: true,
            summary: "empty project; synthesized greenfield analysis".into(),
            cost_usd: 0.0,
        });
    }

    run.was_empty_project = Some(false);
    let call = AgentCall {
        prompt: prompts::ANALYZE_PROMPT.to_string(),
        cwd: ctx.project_dir.clone(),
        allowed_tools: vec!["Read".into(), "Glob".into(), "Grep".into(), "Bash".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => return Ok(PhaseResult { next_phase: Phase::Analyze, success: false, summary: e.to_string(), cost_usd: 0.0 }),
    };
    ctx.store.record_cost(&run.id, "analyze", None, outcome.cost_usd)?;

    let has_marker = markers::contains_marker(&outcome.output, markers::ANALYZE_COMPLETE);
    let analysis_count = ctx.store.codebase_analysis_context_count(&run.id)?;
    if !has_marker || analysis_count == 0 {
        return Ok(PhaseResult {
            next_phase: Phase::Analyze,
            success: false,
            summary: PhaseError::AnalyzeIncomplete.to_string(),
            cost_usd: outcome.cost_usd,
        });
    }

    let refreshed = ctx.store.load_run(&run.id)?;
    run.codebase_analysis = refreshed.codebase_analysis;

    Ok(PhaseResult { next_phase: Phase::Enumerate, success: true, summary: "analysis complete".into(), cost_usd: outcome.cost_usd })
}

/// §4.2.2 enumerate granularity validator: non-fatal warnings, not a
/// separate subsystem — stored as `discovery` context entries.
pub fn validate_task_granularity(tasks: &[Task]) -> Vec<String> {
    let mut warnings = Vec::new();
    for t in tasks {
        if t.estimated_iterations > 30 {
            warnings.push(format!("task '{}' looks too large: {} estimated iterations (> 30)", t.id, t.estimated_iterations));
        }
        if t.estimated_iterations < 2 {
            warnings.push(format!("task '{}' looks too small: {} estimated iterations (< 2)", t.id, t.estimated_iterations));
        }
        if t.description.len() < 10 {
            warnings.push(format!("task '{}' is underspecified: description is under 10 characters", t.id));
        }
    }
    warnings
}

pub fn next_phase_after_enumerate(review_after_enumerate: bool) -> Phase {
    if review_after_enumerate { Phase::Review } else { Phase::Plan }
}

async fn enumerate(run: &mut Run, ctx: &PhaseContext, profile: &EffortProfile) -> SqResult<PhaseResult> {
    let analysis = run.codebase_analysis.clone().unwrap_or_else(CodebaseAnalysis::empty_project);
    let call = AgentCall {
        prompt: prompts::enumerate_prompt(&ctx.spec_text, &analysis),
        cwd: ctx.project_dir.clone(),
        allowed_tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => return Ok(PhaseResult { next_phase: Phase::Enumerate, success: false, summary: e.to_string(), cost_usd: 0.0 }),
    };
    ctx.store.record_cost(&run.id, "enumerate", None, outcome.cost_usd)?;

    let tasks = ctx.store.load_tasks(&run.id)?;
    let has_marker = markers::contains_marker(&outcome.output, markers::ENUMERATE_COMPLETE);
    if !has_marker || tasks.is_empty() {
        return Ok(PhaseResult {
            next_phase: Phase::Enumerate,
            success: false,
            summary: PhaseError::EnumerateIncomplete.to_string(),
            cost_usd: outcome.cost_usd,
        });
    }

    for warning in validate_task_granularity(&tasks) {
        ctx.store.append_context(&run.id, ContextType::Discovery, warning, None, None, None, None)?;
    }

    let next = next_phase_after_enumerate(profile.review_after_enumerate);
    if next == Phase::Review {
        run.pending_review = Some(ReviewType::Enumerate);
    }
    Ok(PhaseResult { next_phase: next, success: true, summary: format!("{} tasks enumerated", tasks.len()), cost_usd: outcome.cost_usd })
}

/// §4.2.3 plan: validates the parallel-groups contract from spec §3
/// before trusting an agent-authored graph (union covers every task
/// exactly once; every dependency sits in an earlier group).
pub fn validate_plan_groups(tasks: &[Task], groups: &[Vec<String>]) -> Result<(), String> {
    let all_ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut placed_before: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for group in groups {
        for id in group {
            if !all_ids.contains(id.as_str()) {
                return Err(format!("plan group references unknown task '{id}'"));
            }
            if !seen.insert(id.as_str()) {
                return Err(format!("task '{id}' appears in more than one plan group"));
            }
        }
        for id in group {
            let task = tasks.iter().find(|t| t.id == *id).expect("checked above");
            for dep in &task.dependencies {
                if !placed_before.contains(dep.as_str()) {
                    return Err(format!("task '{id}' depends on '{dep}' which is not in an earlier group"));
                }
            }
        }
        for id in group {
            placed_before.insert(id.as_str());
        }
    }

    if seen.len() != all_ids.len() {
        return Err("plan groups do not cover every task exactly once".to_string());
    }
    Ok(())
}

pub fn next_phase_after_plan(review_after_plan: bool) -> Phase {
    if review_after_plan { Phase::Review } else { Phase::Build }
}

async fn plan(run: &mut Run, ctx: &PhaseContext, profile: &EffortProfile) -> SqResult<PhaseResult> {
    let tasks = ctx.store.load_tasks(&run.id)?;
    let call = AgentCall {
        prompt: prompts::plan_prompt(&tasks),
        cwd: ctx.project_dir.clone(),
        allowed_tools: vec!["Read".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => return Ok(PhaseResult { next_phase: Phase::Plan, success: false, summary: e.to_string(), cost_usd: 0.0 }),
    };
    ctx.store.record_cost(&run.id, "plan", None, outcome.cost_usd)?;

    let groups = ctx.store.load_plan_groups(&run.id)?;
    let has_marker = markers::contains_marker(&outcome.output, markers::PLAN_COMPLETE);
    if !has_marker || groups.is_empty() {
        return Ok(PhaseResult {
            next_phase: Phase::Plan,
            success: false,
            summary: PhaseError::PlanIncomplete.to_string(),
            cost_usd: outcome.cost_usd,
        });
    }

    if let Err(reason) = validate_plan_groups(&tasks, &groups) {
        return Ok(PhaseResult { next_phase: Phase::Plan, success: false, summary: reason, cost_usd: outcome.cost_usd });
    }

    let next = next_phase_after_plan(profile.review_after_plan);
    if next == Phase::Review {
        run.pending_review = Some(ReviewType::Plan);
    }
    Ok(PhaseResult { next_phase: next, success: true, summary: format!("{} plan groups", groups.len()), cost_usd: outcome.cost_usd })
}

/// §4.2.4 build: not an agent call, one Loop Scheduler iteration.
async fn build(run: &mut Run, ctx: &PhaseContext) -> SqResult<PhaseResult> {
    let groups = ctx.store.load_plan_groups(&run.id)?;
    let graph = TaskGraph { parallel_groups: groups };
    let outcome = ctx.scheduler.step(&run.id, &graph, Arc::clone(&ctx.callbacks)).await?;

    if outcome.any_conflict {
        return Ok(PhaseResult { next_phase: Phase::Conflict, success: true, summary: "merge conflict detected".into(), cost_usd: 0.0 });
    }
    if outcome.any_stuck {
        return Ok(PhaseResult { next_phase: Phase::Revise, success: false, summary: "a loop got stuck".into(), cost_usd: 0.0 });
    }
    if outcome.all_tasks_completed {
        run.pending_review = Some(ReviewType::Build);
        return Ok(PhaseResult { next_phase: Phase::Review, success: true, summary: "all tasks completed".into(), cost_usd: 0.0 });
    }
    if outcome.needs_checkpoint_review {
        run.pending_review = Some(ReviewType::Build);
        for loop_state in ctx.store.load_loops(&run.id)? {
            let due = loop_state.status.is_active()
                && loop_state.review_interval > 0
                && loop_state.iteration > loop_state.last_checkpoint_review_at
                && loop_state.iteration % loop_state.review_interval == 0;
            if due {
                let mut updated = loop_state;
                updated.last_checkpoint_review_at = updated.iteration;
                ctx.store.persist_loop_state(&run.id, &updated)?;
            }
        }
        return Ok(PhaseResult { next_phase: Phase::Review, success: true, summary: "checkpoint review due".into(), cost_usd: 0.0 });
    }

    Ok(PhaseResult { next_phase: Phase::Build, success: true, summary: "iteration advanced".into(), cost_usd: 0.0 })
}

/// §4.2.5 review's "next(reviewType)" table: enumerate -> plan,
/// plan -> build, build -> complete iff every task is completed, else
/// back to build.
pub fn next_phase_after_review(review_type: ReviewType, all_tasks_completed: bool) -> Phase {
    match review_type {
        ReviewType::Enumerate => Phase::Plan,
        ReviewType::Plan => Phase::Build,
        ReviewType::Build => if all_tasks_completed { Phase::Complete } else { Phase::Build },
    }
}

async fn review(run: &mut Run, ctx: &PhaseContext) -> SqResult<PhaseResult> {
    let review_type = run.pending_review.unwrap_or(ReviewType::Build);
    let scope = match review_type {
        ReviewType::Enumerate => "enumerate",
        ReviewType::Plan => "plan",
        ReviewType::Build => "build",
    };
    let profile = run.effort.profile();
    let call = AgentCall {
        prompt: prompts::review_prompt(profile.review_depth, scope),
        cwd: ctx.project_dir.clone(),
        allowed_tools: vec!["Read".into(), "Glob".into(), "Grep".into(), "Bash".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => return Ok(PhaseResult { next_phase: Phase::Review, success: false, summary: e.to_string(), cost_usd: 0.0 }),
    };
    ctx.store.record_cost(&run.id, "review", None, outcome.cost_usd)?;

    if !markers::contains_marker(&outcome.output, markers::REVIEW_COMPLETE) {
        return Ok(PhaseResult {
            next_phase: Phase::Review,
            success: false,
            summary: PhaseError::ReviewIncomplete.to_string(),
            cost_usd: outcome.cost_usd,
        });
    }

    let tasks = ctx.store.load_tasks(&run.id)?;
    let mut passed = ctx.store.review_passed(&run.id, None)?;
    for t in &tasks {
        passed = passed && ctx.store.review_passed(&run.id, Some(&t.id))?;
    }

    run.pending_review = None;

    if !passed {
        return Ok(PhaseResult { next_phase: Phase::Revise, success: false, summary: "review failed; issues attached".into(), cost_usd: outcome.cost_usd });
    }

    let all_tasks_completed = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed);
    let next = next_phase_after_review(review_type, all_tasks_completed);
    Ok(PhaseResult { next_phase: next, success: true, summary: "review passed".into(), cost_usd: outcome.cost_usd })
}

/// §4.2 cross-cutting rule: "Revisions are capped per effort level".
pub fn revision_cap_exceeded(revision_count: u32, max_revisions: u32) -> bool {
    revision_count >= max_revisions
}

/// §4.2.6 revise
async fn revise(run: &mut Run, ctx: &PhaseContext, profile: &EffortProfile) -> SqResult<PhaseResult> {
    if revision_cap_exceeded(run.revision_count, profile.max_revisions) {
        let err = PhaseError::RevisionCapExceeded { attempted: run.revision_count + 1, max: profile.max_revisions };
        return Ok(PhaseResult { next_phase: Phase::Complete, success: false, summary: err.to_string(), cost_usd: 0.0 });
    }

    let issues = ctx.store.load_review_issues(&run.id, None)?;
    let call = AgentCall {
        prompt: prompts::revise_prompt(&issues),
        cwd: ctx.project_dir.clone(),
        allowed_tools: vec!["Read".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => return Ok(PhaseResult { next_phase: Phase::Build, success: false, summary: e.to_string(), cost_usd: 0.0 }),
    };
    ctx.store.record_cost(&run.id, "revise", None, outcome.cost_usd)?;
    run.revision_count += 1;

    Ok(PhaseResult { next_phase: Phase::Build, success: true, summary: format!("revision {} recorded", run.revision_count), cost_usd: outcome.cost_usd })
}

/// §4.2.7 conflict: drains one pending conflict per phase entry
/// (spec §9 open question, resolved serialized in DESIGN.md).
async fn conflict(run: &mut Run, ctx: &PhaseContext) -> SqResult<PhaseResult> {
    let Some(pending) = run.pending_conflicts.pop_front() else {
        return Ok(PhaseResult { next_phase: Phase::Build, success: true, summary: "no pending conflicts".into(), cost_usd: 0.0 });
    };

    // `merge()` checks out and resolves against the main repo checkout,
    // not the per-loop worktree — conflict markers land there, so the
    // resolution agent must run there too (worktree.rs's `merge`).
    let cwd = ctx.worktrees.repo_path().map(Path::to_path_buf).unwrap_or_else(|| ctx.project_dir.clone());
    let call = AgentCall {
        prompt: prompts::conflict_prompt(&pending.conflict_files),
        cwd,
        allowed_tools: vec!["Read".into(), "Edit".into(), "Bash".into()],
        max_turns: ctx.max_turns,
        model: ctx.model.clone(),
    };
    let outcome = match ctx.agent.run(&call, forward(ctx)).await {
        Ok(o) => o,
        Err(e) => {
            let summary = e.to_string();
            run.pending_conflicts.push_front(pending);
            return Ok(PhaseResult { next_phase: Phase::Conflict, success: false, summary, cost_usd: 0.0 });
        }
    };
    ctx.store.record_cost(&run.id, "conflict", Some(&pending.loop_id), outcome.cost_usd)?;

    if markers::contains_marker(&outcome.output, markers::CONFLICT_RESOLVED) {
        match ctx.worktrees.merge(&run.id, &pending.loop_id) {
            Ok(MergeOutcome::Success) => {
                let affected: Vec<String> = ctx
                    .store
                    .load_tasks(&run.id)?
                    .into_iter()
                    .filter(|t| t.assigned_loop.as_deref() == Some(pending.loop_id.as_str()))
                    .map(|t| t.id)
                    .collect();
                for task_id in affected {
                    ctx.store.complete_task(&run.id, &task_id)?;
                }
                ctx.store.update_loop_status(&run.id, &pending.loop_id, LoopStatus::Completed)?;
                Ok(PhaseResult {
                    next_phase: Phase::Build,
                    success: true,
                    summary: format!("conflict resolved for loop {}", pending.loop_id),
                    cost_usd: outcome.cost_usd,
                })
            }
            Ok(MergeOutcome::Conflict { conflict_files }) => {
                run.pending_conflicts.push_back(PendingConflict {
                    loop_id: pending.loop_id.clone(),
                    task_id: pending.task_id.clone(),
                    conflict_files,
                });
                Ok(PhaseResult {
                    next_phase: Phase::Build,
                    success: false,
                    summary: "conflict persists after resolution attempt".into(),
                    cost_usd: outcome.cost_usd,
                })
            }
            Err(e) => Err(e.into()),
        }
    } else {
        let message = markers::conflict_failed_message(&outcome.output).unwrap_or_else(|| "unresolved".to_string());
        ctx.store.fail_task(&run.id, &pending.task_id)?;
        ctx.store.update_loop_status(&run.id, &pending.loop_id, LoopStatus::Failed)?;
        ctx.store.append_context(
            &run.id,
            ContextType::Error,
            format!("conflict resolution failed: {message}"),
            Some(pending.task_id.clone()),
            Some(pending.loop_id.clone()),
            None,
            None,
        )?;
        Ok(PhaseResult {
            next_phase: Phase::Build,
            success: false,
            summary: format!("conflict resolution failed: {message}"),
            cost_usd: outcome.cost_usd,
        })
    }
}
