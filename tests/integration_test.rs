//! Crate-level integration tests: drive the Phase Engine through a
//! full analyze -> enumerate -> plan -> build -> review -> complete
//! run against a scripted stand-in for the agent runtime, the way the
//! donor's `tests/integration_tests.rs` exercises its CLI end to end.
//!
//! The tool host that would normally turn an agent's tool calls into
//! Run Store writes is an external collaborator (spec §1 "Out of
//! scope"); these tests stand in for it by writing directly to the
//! store, exactly as a tool-host subprocess would, before invoking the
//! phase that expects to read it back.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sq::agent::AgentRuntime;
use sq::callbacks::NullCallbacks;
use sq::effort::EffortLevel;
use sq::model::{CostLimits, CostTracking, Phase, ReviewIssue, RunConfigSnapshot, Task, TaskStatus};
use sq::phase::{self, PhaseContext};
use sq::scheduler::LoopScheduler;
use sq::store::RunStore;
use sq::stuck::StuckThresholds;
use sq::worktree::WorktreeManager;
use tempfile::tempdir;

/// Writes a tiny shell script that echoes a fixed stream-json
/// transcript to stdout regardless of the prompt it's given on stdin,
/// and returns its path. Used as the agent command for a `PhaseContext`
/// so phase tests don't depend on a real agent binary being installed.
///
/// Written into a scratch directory separate from the project dir used
/// as `ctx.project_dir`, so its presence never defeats the empty-project
/// detector the analyze phase runs against that directory.
fn stub_agent(scripts_dir: &Path, marker: &str) -> std::path::PathBuf {
    let script = scripts_dir.join("stub-agent.sh");
    let body = format!(
        "#!/bin/sh\ncat > /dev/null\necho '{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"{marker}\"}}]}}}}'\necho '{{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"is_error\":false,\"total_cost_usd\":0.01}}'\n"
    );
    std::fs::write(&script, body).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

fn sample_run(effort: EffortLevel) -> sq::model::Run {
    sq::model::Run {
        id: "run-1".to_string(),
        spec_path: "spec.md".to_string(),
        effort,
        phase: Phase::Analyze,
        phase_history: Vec::new(),
        config: RunConfigSnapshot { max_loops: 4, max_iterations: 50, state_dir: ".sq".into(), use_worktrees: false, base_branch: None },
        codebase_analysis: None,
        was_empty_project: None,
        pending_review: None,
        revision_count: 0,
        pending_conflicts: VecDeque::new(),
        costs: CostTracking::default(),
        cost_limits: CostLimits { per_run_max_usd: 100.0, per_phase_max_usd: 50.0, per_loop_max_usd: 20.0 },
    }
}

fn ctx_with_marker(project_dir: &Path, scripts_dir: &Path, store: &Arc<RunStore>, marker: &str) -> PhaseContext {
    let agent_cmd = stub_agent(scripts_dir, marker);
    let agent = Arc::new(AgentRuntime::new(agent_cmd.to_string_lossy().to_string(), Duration::from_secs(5)));
    let worktrees = Arc::new(WorktreeManager::Disabled);
    PhaseContext {
        store: Arc::clone(store),
        agent: Arc::clone(&agent),
        worktrees: Arc::clone(&worktrees),
        scheduler: Arc::new(LoopScheduler {
            store: Arc::clone(store),
            worktrees: Arc::clone(&worktrees),
            agent: Arc::clone(&agent),
            max_loops: 4,
            max_turns_per_iteration: 10,
            model: "sonnet".to_string(),
            thresholds: StuckThresholds::default(),
        }),
        callbacks: Arc::new(NullCallbacks),
        project_dir: project_dir.to_path_buf(),
        spec_text: "# spec\nbuild a greeter".to_string(),
        model: "sonnet".to_string(),
        max_turns: 10,
    }
}

#[tokio::test]
async fn empty_project_analyze_skips_the_agent_and_synthesizes_analysis() {
    let dir = tempdir().unwrap();
    let scripts_dir = tempdir().unwrap();
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let mut run = sample_run(EffortLevel::Medium);
    store.create_run(&run).unwrap();

    // No agent invoked: the stub would fail loudly (no such command) if
    // called, proving the empty-project path short-circuits it.
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "ANALYZE_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();

    assert!(result.success);
    assert_eq!(result.next_phase, Phase::Enumerate);
    assert_eq!(result.cost_usd, 0.0);
    assert_eq!(run.was_empty_project, Some(true));
    assert!(run.codebase_analysis.is_some());
}

#[tokio::test]
async fn single_task_no_deps_yields_one_group_and_completes_via_build() {
    let dir = tempdir().unwrap();
    let scripts_dir = tempdir().unwrap();
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let mut run = sample_run(EffortLevel::Low);
    store.create_run(&run).unwrap();

    // analyze (empty project, no agent call needed)
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "ANALYZE_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Enumerate);

    // enumerate: the tool host would have called write_task during the
    // agent call; simulate that write before the phase reads it back.
    store
        .write_task(
            &run.id,
            &Task {
                id: "t1".to_string(),
                title: "Greeter".to_string(),
                description: "implement a friendly greeter function".to_string(),
                status: TaskStatus::Pending,
                dependencies: vec![],
                estimated_iterations: 3,
                assigned_loop: None,
            },
            0,
        )
        .unwrap();
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "ENUMERATE_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);
    run.phase = result.next_phase;
    // effort=low never reviews after enumerate or plan (spec §6 table).
    assert_eq!(run.phase, Phase::Plan);

    // plan: single task, single group.
    store.add_plan_group(&run.id, 0, &["t1".to_string()]).unwrap();
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "PLAN_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Build);

    let groups = store.load_plan_groups(&run.id).unwrap();
    assert_eq!(groups, vec![vec!["t1".to_string()]]);

    // build: scheduler creates one loop for the one task, the stub
    // agent signals TASK_COMPLETE on its first iteration.
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "TASK_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Review);
    assert_eq!(run.pending_review, Some(sq::model::ReviewType::Build));

    let loops = store.load_loops(&run.id).unwrap();
    assert_eq!(loops.len(), 1, "a single dependency-free task yields exactly one loop");
    assert_eq!(loops[0].status, sq::model::LoopStatus::Completed);

    let tasks = store.load_tasks(&run.id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    // review: clean pass closes the run out.
    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "REVIEW_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Complete);
}

#[tokio::test]
async fn failed_review_routes_to_revise_and_issues_reach_the_next_build_prompt() {
    let dir = tempdir().unwrap();
    let scripts_dir = tempdir().unwrap();
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let mut run = sample_run(EffortLevel::Medium);
    store.create_run(&run).unwrap();
    store
        .write_task(
            &run.id,
            &Task {
                id: "t1".to_string(),
                title: "Greeter".to_string(),
                description: "implement a friendly greeter function".to_string(),
                status: TaskStatus::InProgress,
                dependencies: vec![],
                estimated_iterations: 3,
                assigned_loop: None,
            },
            0,
        )
        .unwrap();
    run.pending_review = Some(sq::model::ReviewType::Build);
    run.phase = Phase::Review;

    // Simulate the tool host recording one failing issue for t1.
    store
        .set_review_result(
            &run.id,
            Some("t1"),
            &[ReviewIssue {
                task_id: Some("t1".to_string()),
                file: "src/greeter.rs".to_string(),
                line: Some(10),
                issue_type: sq::model::ReviewIssueType::MissingErrorHandling,
                description: "unwrap on user input".to_string(),
                suggestion: "propagate the error instead".to_string(),
            }],
        )
        .unwrap();

    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "REVIEW_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(!result.success);
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Revise);

    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "noted");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);
    run.phase = result.next_phase;
    assert_eq!(run.phase, Phase::Build);
    assert_eq!(run.revision_count, 1);

    let issues = store.load_review_issues(&run.id, Some("t1")).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].file, "src/greeter.rs");
}

#[tokio::test]
async fn revision_cap_exceeded_halts_the_run() {
    let dir = tempdir().unwrap();
    let scripts_dir = tempdir().unwrap();
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let mut run = sample_run(EffortLevel::Low); // max_revisions = 2
    run.revision_count = 2;
    run.phase = Phase::Revise;
    store.create_run(&run).unwrap();

    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "noted");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.next_phase, Phase::Complete);
    assert_eq!(run.revision_count, 2, "no further revision attempted once the cap is hit");
}

#[tokio::test]
async fn granularity_warnings_land_as_discovery_context_without_failing_the_phase() {
    let dir = tempdir().unwrap();
    let scripts_dir = tempdir().unwrap();
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let mut run = sample_run(EffortLevel::Medium);
    run.phase = Phase::Enumerate;
    store.create_run(&run).unwrap();

    store
        .write_task(
            &run.id,
            &Task {
                id: "huge".to_string(),
                title: "Everything".to_string(),
                description: "rewrite the whole system end to end".to_string(),
                status: TaskStatus::Pending,
                dependencies: vec![],
                estimated_iterations: 99,
                assigned_loop: None,
            },
            0,
        )
        .unwrap();

    let ctx = ctx_with_marker(dir.path(), scripts_dir.path(), &store, "ENUMERATE_COMPLETE");
    let result = phase::step(&mut run, &ctx).await.unwrap();
    assert!(result.success);

    let (entries, _) =
        store.read_context(&run.id, &sq::store::ContextFilters { entry_types: Some(vec![sq::model::ContextType::Discovery]), ..Default::default() }).unwrap();
    assert!(entries.iter().any(|e| e.content.contains("huge") && e.content.contains("too large")));
}
