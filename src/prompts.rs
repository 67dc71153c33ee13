//! Build-iteration prompt construction (spec §4.3 step 3a, §9
//! "LLM prompt-prefix caching").
//!
//! The static prefix must come first, byte-for-byte identical across
//! calls, so the upstream agent runtime's prompt cache hits; everything
//! that varies by call (scratchpad, review feedback, iteration count)
//! goes after it. Grounded in the donor's `orchestrator/runner.rs`
//! `generate_prompt` (static `## SPECIFICATION` / `## CRITICAL RULES`
//! header followed by a per-call `## TASK` section).

use crate::effort::ReviewDepth;
use crate::model::{CodebaseAnalysis, ReviewIssue, Task};

pub const ANALYZE_PROMPT: &str = "\
## ANALYZE REPOSITORY

Inspect the current directory and produce a codebase analysis: project \
type, tech stack, directory structure summary, existing features, entry \
points, and any conventions/patterns you notice. Call set_codebase_analysis \
with the result, then signal ANALYZE_COMPLETE.
";

pub fn enumerate_prompt(spec_text: &str, analysis: &CodebaseAnalysis) -> String {
    format!(
        "## ENUMERATE TASKS\n\n\
         Given the specification below and the existing codebase analysis, \
         break the work into an ordered set of tasks. For each task, call \
         write_task with an id, title, description, dependencies (ids of \
         tasks that must complete first), and an estimated iteration count. \
         Signal ENUMERATE_COMPLETE once every task is written.\n\n\
         ## CODEBASE ANALYSIS\n{}\n\n## SPECIFICATION\n{spec_text}\n",
        analysis.summary,
    )
}

pub fn plan_prompt(tasks: &[Task]) -> String {
    let mut listing = String::new();
    for t in tasks {
        listing.push_str(&format!("- {} ({}): depends on {:?}\n", t.id, t.title, t.dependencies));
    }
    format!(
        "## PLAN EXECUTION\n\n\
         Given the task set below, call add_plan_group once per wave of \
         tasks that can run concurrently — every task in a wave must depend \
         only on tasks in an earlier wave. Signal PLAN_COMPLETE once every \
         task is assigned to exactly one wave.\n\n## TASKS\n{listing}",
    )
}

fn review_depth_instructions(depth: ReviewDepth) -> &'static str {
    match depth {
        ReviewDepth::Shallow => "Skim the diff for obvious correctness issues only.",
        ReviewDepth::Standard => "Check correctness, error handling, and adherence to existing patterns.",
        ReviewDepth::Deep => "Check correctness, error handling, pattern adherence, over-engineering, and dead code.",
        ReviewDepth::Comprehensive => {
            "Exhaustively check correctness, error handling, pattern adherence, over-engineering, dead code, \
             and whether the implementation matches the specification's intent."
        }
    }
}

pub fn review_prompt(depth: ReviewDepth, scope: &str) -> String {
    format!(
        "## REVIEW\n\n\
         Review the {scope} work completed so far. {instructions} For each \
         problem found, call set_review_result with the issue's file, \
         optional line, type, description, and suggestion. If nothing is \
         wrong, call set_review_result with an empty issue list. Signal \
         REVIEW_COMPLETE when done.\n",
        instructions = review_depth_instructions(depth),
    )
}

pub fn revise_prompt(issues: &[ReviewIssue]) -> String {
    let mut listing = String::new();
    for issue in issues {
        let location = match issue.line {
            Some(line) => format!("{}:{}", issue.file, line),
            None => issue.file.clone(),
        };
        listing.push_str(&format!("- {location}: {}\n  Suggestion: {}\n", issue.description, issue.suggestion));
    }
    format!(
        "## REVISE\n\n\
         The following review issues were raised. Produce a fix plan — call \
         add_context with each planned fix as a discovery entry — the build \
         phase will pick it up on the next iteration.\n\n## ISSUES\n{listing}",
    )
}

pub fn conflict_prompt(conflict_files: &[String]) -> String {
    format!(
        "## RESOLVE MERGE CONFLICT\n\n\
         The following files have unresolved merge conflicts in this \
         worktree: {conflict_files:?}. Resolve them, then signal \
         CONFLICT_RESOLVED, or CONFLICT_FAILED: <message> if you cannot.\n",
    )
}

pub const BUILD_PROMPT: &str = "\
## BUILD TASK

You are implementing one task from a larger specification inside an \
isolated git worktree. Make focused changes, run any relevant checks, \
and keep edits scoped to this task's files unless a shared interface \
must change.

Signal `ITERATION_DONE` when you stop for this turn, `TASK_COMPLETE` \
when the task is fully implemented and verified, or `TASK_STUCK` if \
you cannot make further progress without outside input.
";

pub struct BuildPromptInput<'a> {
    pub task: &'a Task,
    pub issues: &'a [ReviewIssue],
    pub iteration: u32,
    pub total_iterations: u32,
    pub scratchpad: Option<&'a str>,
}

/// Builds the full iteration prompt: static prefix, then scratchpad (if
/// any), then review feedback filtered to this task, then task
/// metadata and the iteration counter.
pub fn build_prompt_with_feedback(input: &BuildPromptInput) -> String {
    let mut prompt = String::from(BUILD_PROMPT);

    if let Some(scratchpad) = input.scratchpad {
        prompt.push_str("\n## PREVIOUS ITERATION NOTES\n");
        prompt.push_str(scratchpad);
        prompt.push('\n');
    }

    let relevant_issues: Vec<&ReviewIssue> = input
        .issues
        .iter()
        .filter(|issue| issue.task_id.as_deref() == Some(input.task.id.as_str()))
        .collect();

    if !relevant_issues.is_empty() {
        prompt.push_str("\n## REVIEW FEEDBACK\n");
        for issue in relevant_issues {
            let location = match issue.line {
                Some(line) => format!("{}:{}", issue.file, line),
                None => issue.file.clone(),
            };
            prompt.push_str(&format!("- {location}: {}\n  Suggestion: {}\n", issue.description, issue.suggestion));
        }
    }

    prompt.push_str(&format!(
        "\n## TASK\nid: {}\ntitle: {}\ndescription: {}\niteration: {}/{}\n",
        input.task.id, input.task.title, input.task.description, input.iteration, input.total_iterations
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReviewIssueType, TaskStatus};

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "X".to_string(),
            description: "Y".to_string(),
            status: TaskStatus::InProgress,
            dependencies: vec![],
            estimated_iterations: 5,
            assigned_loop: None,
        }
    }

    fn issue(task_id: &str, file: &str, line: u32) -> ReviewIssue {
        ReviewIssue {
            task_id: Some(task_id.to_string()),
            file: file.to_string(),
            line: Some(line),
            issue_type: ReviewIssueType::MissingErrorHandling,
            description: "missing error handling".to_string(),
            suggestion: "propagate the error".to_string(),
        }
    }

    #[test]
    fn build_prompt_stability_fixture() {
        let t1 = task("t1");
        let input = BuildPromptInput { task: &t1, issues: &[], iteration: 1, total_iterations: 10, scratchpad: None };
        let prompt = build_prompt_with_feedback(&input);
        assert!(prompt.starts_with(BUILD_PROMPT));
        assert!(!prompt.contains("## REVIEW FEEDBACK"));

        let issues = vec![issue("t1", "src/index.ts", 42), issue("t2", "src/other.ts", 7)];
        let input = BuildPromptInput { task: &t1, issues: &issues, iteration: 1, total_iterations: 10, scratchpad: None };
        let prompt = build_prompt_with_feedback(&input);
        assert!(prompt.contains("src/index.ts:42"));
        assert!(!prompt.contains("src/other.ts"));
    }

    #[test]
    fn issue_replacement_not_accumulation_fixture() {
        // Review #1 reported {A, B} for t1; review #2 reports {C}. The
        // store layer (see store::reviews) replaces rather than
        // accumulates, so by the time this function runs on iteration 3
        // `issues` already contains only C.
        let t1 = task("t1");
        let mut c = issue("t1", "src/index.ts", 42);
        c.description = "issue-C".to_string();
        let input = BuildPromptInput { task: &t1, issues: &[c], iteration: 3, total_iterations: 10, scratchpad: None };
        let prompt = build_prompt_with_feedback(&input);
        assert!(prompt.contains("issue-C"));
        assert!(!prompt.contains("issue-A"));
        assert!(!prompt.contains("issue-B"));
    }

    #[test]
    fn scratchpad_appears_after_static_prefix() {
        let t1 = task("t1");
        let input = BuildPromptInput { task: &t1, issues: &[], iteration: 2, total_iterations: 10, scratchpad: Some("tests green") };
        let prompt = build_prompt_with_feedback(&input);
        let prefix_end = prompt.find(BUILD_PROMPT).unwrap() + BUILD_PROMPT.len();
        let scratchpad_pos = prompt.find("tests green").unwrap();
        assert!(scratchpad_pos >= prefix_end);
    }

    #[test]
    fn enumerate_prompt_carries_spec_and_analysis() {
        let analysis = CodebaseAnalysis { summary: "a Rust CLI".to_string(), ..CodebaseAnalysis::empty_project() };
        let prompt = enumerate_prompt("# Spec\nbuild a thing", &analysis);
        assert!(prompt.contains("a Rust CLI"));
        assert!(prompt.contains("build a thing"));
        assert!(prompt.contains("ENUMERATE_COMPLETE"));
    }

    #[test]
    fn plan_prompt_lists_dependencies() {
        let t1 = task("t1");
        let prompt = plan_prompt(std::slice::from_ref(&t1));
        assert!(prompt.contains("t1"));
        assert!(prompt.contains("PLAN_COMPLETE"));
    }

    #[test]
    fn review_prompt_scales_with_depth() {
        let shallow = review_prompt(crate::effort::ReviewDepth::Shallow, "build");
        let comprehensive = review_prompt(crate::effort::ReviewDepth::Comprehensive, "build");
        assert!(comprehensive.len() > shallow.len());
        assert!(shallow.contains("REVIEW_COMPLETE"));
    }

    #[test]
    fn conflict_prompt_lists_files() {
        let prompt = conflict_prompt(&["a.rs".to_string(), "b.rs".to_string()]);
        assert!(prompt.contains("a.rs"));
        assert!(prompt.contains("CONFLICT_RESOLVED"));
    }
}
