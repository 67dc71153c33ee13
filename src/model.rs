//! Data model (spec §3): Run, Task, TaskGraph, Loop, context entries,
//! review issues, codebase analysis.
//!
//! Entity shapes are grounded in the donor's `phase.rs` (budget/iteration
//! fields), `factory/models.rs` (status enums), and `audit/mod.rs`
//! (phase history / file-change summaries).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::effort::EffortLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    Enumerate,
    Plan,
    Build,
    Review,
    Revise,
    Conflict,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analyze => "analyze",
            Phase::Enumerate => "enumerate",
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Review => "review",
            Phase::Revise => "revise",
            Phase::Conflict => "conflict",
            Phase::Complete => "complete",
        }
    }
}

/// Which phase a review was requested on behalf of. Drives the
/// "next(reviewType)" transition table in spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Enumerate,
    Plan,
    Build,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub success: bool,
    pub summary: String,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub estimated_iterations: u32,
    pub assigned_loop: Option<String>,
}

/// Tasks plus their wave partition. Invariant (spec §3): every id in
/// group *k* may run concurrently; every task in group *k* depends only
/// on tasks in groups < *k*.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub parallel_groups: Vec<Vec<String>>,
}

impl TaskGraph {
    /// Builds parallel groups from a task set by repeatedly peeling off
    /// the tasks whose dependencies are already fully assigned to an
    /// earlier group (Kahn-style wave computation).
    pub fn from_tasks(tasks: &[Task]) -> Result<TaskGraph, String> {
        let ids: std::collections::HashSet<&str> =
            tasks.iter().map(|t| t.id.as_str()).collect();
        for t in tasks {
            for dep in &t.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(format!("unknown dependency '{dep}' on task '{}'", t.id));
                }
            }
        }

        let mut remaining: Vec<&Task> = tasks.iter().collect();
        let mut placed: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut groups = Vec::new();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<&Task>, Vec<&Task>) = remaining
                .into_iter()
                .partition(|t| t.dependencies.iter().all(|d| placed.contains(d.as_str())));
            if ready.is_empty() {
                return Err("cycle detected in task dependencies".to_string());
            }
            let mut group: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
            group.sort();
            for id in &group {
                placed.insert(tasks.iter().find(|t| &t.id == id).unwrap().id.as_str());
            }
            groups.push(group);
            remaining = rest;
        }

        Ok(TaskGraph { parallel_groups: groups })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Pending,
    Running,
    Stuck,
    Completed,
    Failed,
    Interrupted,
}

impl LoopStatus {
    pub fn is_active(self) -> bool {
        matches!(self, LoopStatus::Pending | LoopStatus::Running | LoopStatus::Stuck)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopStatus::Completed | LoopStatus::Failed | LoopStatus::Interrupted
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StuckIndicators {
    pub same_error_count: u32,
    pub no_progress_count: u32,
    pub last_error: Option<String>,
    pub last_file_change_iteration: u32,
    pub last_activity_unix_ms: i64,
}

/// Bounded ring of the most recent raw output lines for a loop (spec
/// §8 fixture 5). Backed by a `VecDeque`; no direct donor source (the
/// closest donor analogue, `swarm/callback.rs`'s bounded event log, was
/// dropped with the rest of `swarm/`) but this is the standard shape
/// for a fixed-capacity ring in the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircularBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        CircularBuffer { capacity: capacity.max(1), items: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn to_array(&self) -> Vec<&T> {
        self.items.iter().collect()
    }

    pub fn last(&self, n: usize) -> Vec<&T> {
        let len = self.items.len();
        let skip = len.saturating_sub(n);
        self.items.iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub id: String,
    pub task_ids: Vec<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub review_interval: u32,
    pub last_checkpoint_review_at: u32,
    pub status: LoopStatus,
    pub stuck: StuckIndicators,
    #[serde(skip)]
    pub recent_output: CircularBuffer<String>,
    pub worktree_path: Option<String>,
    pub originating_phase: Phase,
    pub review_status: Option<bool>,
    pub last_review_id: Option<String>,
    pub revision_attempts: u32,
}

impl LoopState {
    pub fn new(id: String, task_ids: Vec<String>, max_iterations: u32, review_interval: u32, originating_phase: Phase) -> Self {
        LoopState {
            id,
            task_ids,
            iteration: 0,
            max_iterations,
            review_interval,
            last_checkpoint_review_at: 0,
            status: LoopStatus::Pending,
            stuck: StuckIndicators::default(),
            recent_output: CircularBuffer::new(200),
            worktree_path: None,
            originating_phase,
            review_status: None,
            last_review_id: None,
            revision_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Discovery,
    Error,
    Decision,
    ReviewIssue,
    CodebaseAnalysis,
    Scratchpad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub entry_type: ContextType,
    pub content: String,
    pub task_id: Option<String>,
    pub loop_id: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewIssueType {
    OverEngineering,
    MissingErrorHandling,
    PatternViolation,
    DeadCode,
    SpecIntentMismatch,
    ArchitectureConcern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub task_id: Option<String>,
    pub file: String,
    pub line: Option<u32>,
    pub issue_type: ReviewIssueType,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebaseAnalysis {
    pub project_type: String,
    pub tech_stack: Vec<String>,
    pub directory_structure: String,
    pub existing_features: Vec<String>,
    pub entry_points: Vec<String>,
    pub patterns: Vec<String>,
    pub summary: String,
}

impl CodebaseAnalysis {
    /// Synthesized when the project is empty/greenfield (spec §4.2.1).
    pub fn empty_project() -> Self {
        CodebaseAnalysis {
            project_type: "greenfield".to_string(),
            tech_stack: Vec::new(),
            directory_structure: String::new(),
            existing_features: Vec::new(),
            entry_points: Vec::new(),
            patterns: Vec::new(),
            summary: "Empty project; no existing code detected.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflict {
    pub loop_id: String,
    pub task_id: String,
    pub conflict_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracking {
    pub total_usd: f64,
    pub per_phase_usd: std::collections::HashMap<String, f64>,
    pub per_loop_usd: std::collections::HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostLimits {
    pub per_run_max_usd: f64,
    pub per_phase_max_usd: f64,
    pub per_loop_max_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    pub max_loops: usize,
    pub max_iterations: u32,
    pub state_dir: String,
    pub use_worktrees: bool,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub spec_path: String,
    pub effort: EffortLevel,
    pub phase: Phase,
    pub phase_history: Vec<PhaseHistoryEntry>,
    pub config: RunConfigSnapshot,
    pub codebase_analysis: Option<CodebaseAnalysis>,
    pub was_empty_project: Option<bool>,
    pub pending_review: Option<ReviewType>,
    pub revision_count: u32,
    pub pending_conflicts: VecDeque<PendingConflict>,
    pub costs: CostTracking,
    pub cost_limits: CostLimits,
}
