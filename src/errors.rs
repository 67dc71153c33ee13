//! Error hierarchy for the orchestrator.
//!
//! Mirrors the layering of a donor-style error module: small `thiserror`
//! enums near the subsystem that raises them, converted with `#[from]`
//! into the crate-wide [`SqError`] that the driver's outer loop matches on.

use std::path::PathBuf;
use thiserror::Error;

/// A phase invoked the agent runtime but did not observe the artifacts or
/// completion marker it requires to advance. See spec §7 "Incompleteness".
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("analyze incomplete: no ANALYZE_COMPLETE marker or no analysis persisted")]
    AnalyzeIncomplete,
    #[error("enumerate incomplete: no ENUMERATE_COMPLETE marker or zero tasks persisted")]
    EnumerateIncomplete,
    #[error("plan incomplete: no PLAN_COMPLETE marker or zero plan groups persisted")]
    PlanIncomplete,
    #[error("review incomplete: no REVIEW_COMPLETE marker seen")]
    ReviewIncomplete,
    #[error("revision cap exceeded: {attempted} > {max}")]
    RevisionCapExceeded { attempted: u32, max: u32 },
}

/// Raised by the Worktree Manager. A merge conflict is a normal merge
/// outcome (spec §4.4), not an error — it is reported as
/// `worktree::MergeOutcome::Conflict`, not through this enum.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),
}

/// Raised by the Agent Runtime Adapter.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("agent exited with non-zero status: {0}")]
    NonZeroExit(i32),
    #[error("idle timeout: no event received for {seconds}s")]
    IdleTimeout { seconds: u64 },
    #[error("failed to write prompt to agent stdin: {0}")]
    PromptWriteFailed(#[source] std::io::Error),
}

/// Raised by the Run Store. Always fatal: spec §7 "the run cannot trust
/// its own state" once storage is suspect.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("malformed artifact from tool host: {0}")]
    MalformedArtifact(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("migration failed: {0}")]
    Migration(String),
}

/// Crate-wide error type returned by the driver and phase engine.
#[derive(Debug, Error)]
pub enum SqError {
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cost limit exceeded: {0}")]
    CostLimit(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SqResult<T> = Result<T, SqError>;
