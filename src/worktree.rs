//! Worktree Manager (spec §4.4): filesystem isolation per loop via
//! `git2` worktrees.
//!
//! Generalizes the donor's `tracker/git.rs` `GitTracker` (which
//! snapshots/diffs the single working tree on the base branch) into a
//! branch-per-loop create/merge/cleanup protocol. Unborn-HEAD handling
//! and the `git diff --name-only --diff-filter=U`-equivalent conflict
//! detection (via `Index::conflicts`) carry over directly.

use std::path::{Path, PathBuf};

use git2::{Repository, Signature, WorktreeAddOptions};

use crate::errors::WorktreeError;

pub enum MergeOutcome {
    Success,
    Conflict { conflict_files: Vec<String> },
}

/// Absent (no-op) when the target isn't a git repo, or worktrees are
/// disabled — in that mode the caller runs loops directly in the
/// target directory (spec §4.4 "Contract").
pub enum WorktreeManager {
    Git { repo_path: PathBuf, state_dir: PathBuf, base_branch: String },
    Disabled,
}

impl WorktreeManager {
    pub fn open(repo_path: &Path, state_dir: &Path, use_worktrees: bool) -> Result<Self, WorktreeError> {
        if !use_worktrees {
            return Ok(WorktreeManager::Disabled);
        }
        match Repository::open(repo_path) {
            Ok(repo) => {
                let base_branch = current_branch_name(&repo)?;
                Ok(WorktreeManager::Git {
                    repo_path: repo_path.to_path_buf(),
                    state_dir: state_dir.to_path_buf(),
                    base_branch,
                })
            }
            Err(_) => Ok(WorktreeManager::Disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, WorktreeManager::Git { .. })
    }

    /// Creates branch `sq/<runId>/<loopId>` off the base branch and
    /// attaches a worktree at `<stateDir>/worktrees/<loopId>`.
    pub fn create(&self, run_id: &str, loop_id: &str) -> Result<Option<PathBuf>, WorktreeError> {
        let WorktreeManager::Git { repo_path, state_dir, base_branch } = self else {
            return Ok(None);
        };
        let repo = Repository::open(repo_path)?;
        let branch_name = format!("sq/{run_id}/{loop_id}");

        let base_commit = repo
            .find_branch(base_branch, git2::BranchType::Local)
            .ok()
            .and_then(|b| b.get().peel_to_commit().ok())
            .or_else(|| repo.head().ok().and_then(|h| h.peel_to_commit().ok()));

        if repo.find_branch(&branch_name, git2::BranchType::Local).is_err() {
            if let Some(commit) = &base_commit {
                repo.branch(&branch_name, commit, false)?;
            } else {
                return Err(WorktreeError::NotARepo(repo_path.clone()));
            }
        }

        let worktree_path = state_dir.join("worktrees").join(loop_id);
        if repo.find_worktree(loop_id).is_err() {
            let mut opts = WorktreeAddOptions::new();
            let branch_ref = repo.find_branch(&branch_name, git2::BranchType::Local)?;
            let reference = branch_ref.into_reference();
            opts.reference(Some(&reference));
            repo.worktree(loop_id, &worktree_path, Some(&opts))?;
        }

        Ok(Some(worktree_path))
    }

    /// Auto-commits any changes in the loop's worktree, checks out the
    /// base branch, and merges with `--no-ff`. On conflict, returns
    /// the unmerged path list instead of erroring.
    pub fn merge(&self, run_id: &str, loop_id: &str) -> Result<MergeOutcome, WorktreeError> {
        let WorktreeManager::Git { repo_path, base_branch, .. } = self else {
            return Ok(MergeOutcome::Success);
        };
        let branch_name = format!("sq/{run_id}/{loop_id}");

        let worktree_repo = Repository::open(self.worktree_path(loop_id).unwrap())?;
        commit_all(&worktree_repo, &format!("loop {loop_id}: checkpoint"))?;

        let repo = Repository::open(repo_path)?;
        let their_commit = repo.find_branch(&branch_name, git2::BranchType::Local)?.get().peel_to_commit()?;
        let their_annotated = repo.find_annotated_commit(their_commit.id())?;

        repo.set_head(&format!("refs/heads/{base_branch}"))?;
        repo.checkout_head(None)?;

        let (analysis, _preference) = repo.merge_analysis(&[&their_annotated])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::Success);
        }

        let mut merge_opts = git2::MergeOptions::new();
        repo.merge(&[&their_annotated], Some(&mut merge_opts), None)?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            let conflict_files: Vec<String> = index
                .conflicts()?
                .filter_map(|c| c.ok())
                .filter_map(|c| c.our.or(c.their))
                .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
                .collect();
            return Ok(MergeOutcome::Conflict { conflict_files });
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("sq", "sq@localhost")?;
        let head_commit = repo.head()?.peel_to_commit()?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("merge: {branch_name}"),
            &tree,
            &[&head_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        Ok(MergeOutcome::Success)
    }

    pub fn cleanup(&self, loop_id: &str) -> Result<(), WorktreeError> {
        let WorktreeManager::Git { repo_path, .. } = self else {
            return Ok(());
        };
        let repo = Repository::open(repo_path)?;
        if let Ok(wt) = repo.find_worktree(loop_id) {
            wt.prune(None)?;
            let _ = std::fs::remove_dir_all(wt.path());
        }
        Ok(())
    }

    pub fn cleanup_all(&self, loop_ids: &[String]) -> Result<(), WorktreeError> {
        for id in loop_ids {
            self.cleanup(id)?;
        }
        Ok(())
    }

    pub fn worktree_path(&self, loop_id: &str) -> Option<PathBuf> {
        match self {
            WorktreeManager::Git { state_dir, .. } => Some(state_dir.join("worktrees").join(loop_id)),
            WorktreeManager::Disabled => None,
        }
    }

    /// The main checkout `merge()` actually operates against — where an
    /// unresolved conflict's markers land, not the per-loop worktree.
    pub fn repo_path(&self) -> Option<&Path> {
        match self {
            WorktreeManager::Git { repo_path, .. } => Some(repo_path.as_path()),
            WorktreeManager::Disabled => None,
        }
    }
}

fn current_branch_name(repo: &Repository) -> Result<String, WorktreeError> {
    match repo.head() {
        Ok(head) => Ok(head.shorthand().unwrap_or("main").to_string()),
        Err(_) => Ok("main".to_string()),
    }
}

fn commit_all(repo: &Repository, message: &str) -> Result<(), WorktreeError> {
    let mut index = repo.index()?;
    index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

    if let Some(parent) = &parent {
        if parent.tree_id() == tree_id {
            return Ok(());
        }
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("sq", "sq@localhost")?;
    match parent {
        Some(parent) => {
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        }
        None => {
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo_with_commit(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        commit_all(&repo, "initial commit").unwrap();
        repo
    }

    #[test]
    fn disabled_when_not_a_repo() {
        let dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let mgr = WorktreeManager::open(dir.path(), state_dir.path(), true).unwrap();
        assert!(!mgr.is_enabled());
    }

    #[test]
    fn disabled_when_flag_false() {
        let dir = tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let state_dir = tempdir().unwrap();
        let mgr = WorktreeManager::open(dir.path(), state_dir.path(), false).unwrap();
        assert!(!mgr.is_enabled());
    }

    #[test]
    fn create_attaches_worktree_on_new_branch() {
        let dir = tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let state_dir = tempdir().unwrap();
        let mgr = WorktreeManager::open(dir.path(), state_dir.path(), true).unwrap();
        let path = mgr.create("run-1", "loop-1").unwrap().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn merge_succeeds_with_no_conflicting_changes() {
        let dir = tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let state_dir = tempdir().unwrap();
        let mgr = WorktreeManager::open(dir.path(), state_dir.path(), true).unwrap();
        let wt_path = mgr.create("run-1", "loop-1").unwrap().unwrap();
        std::fs::write(wt_path.join("new_file.txt"), "content").unwrap();

        let outcome = mgr.merge("run-1", "loop-1").unwrap();
        assert!(matches!(outcome, MergeOutcome::Success));
        assert!(dir.path().join("new_file.txt").exists());
    }

    #[test]
    fn merge_detects_conflicting_changes_on_same_file() {
        let dir = tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let state_dir = tempdir().unwrap();
        let mgr = WorktreeManager::open(dir.path(), state_dir.path(), true).unwrap();

        // Both loop branches are cut from the same base commit before
        // either merges back, so their edits to the same file genuinely
        // diverge (a loop branched after the first merge would just
        // fast-forward instead of conflicting).
        let wt1 = mgr.create("run-1", "loop-1").unwrap().unwrap();
        let wt2 = mgr.create("run-1", "loop-2").unwrap().unwrap();
        std::fs::write(wt1.join("conflict.txt"), "from loop 1").unwrap();
        std::fs::write(wt2.join("conflict.txt"), "from loop 2, divergent").unwrap();

        let outcome1 = mgr.merge("run-1", "loop-1").unwrap();
        assert!(matches!(outcome1, MergeOutcome::Success));

        let outcome2 = mgr.merge("run-1", "loop-2").unwrap();
        match outcome2 {
            MergeOutcome::Conflict { conflict_files } => {
                assert_eq!(conflict_files, vec!["conflict.txt".to_string()]);
            }
            MergeOutcome::Success => panic!("expected a conflict"),
        }
    }
}
