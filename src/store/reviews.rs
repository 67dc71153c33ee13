//! Review issues: materialized over context entries of type
//! `review_issue` (spec §3 "ReviewIssue (materialized from context of
//! type review_issue)"). "On fail, issues replace (not accumulate) any
//! existing issues for the same task id" (spec §4.2.5) — implemented as
//! delete-then-insert, scoped by task id.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::{ContextType, ReviewIssue, ReviewIssueType};

fn issue_type_str(t: ReviewIssueType) -> &'static str {
    match t {
        ReviewIssueType::OverEngineering => "over-engineering",
        ReviewIssueType::MissingErrorHandling => "missing-error-handling",
        ReviewIssueType::PatternViolation => "pattern-violation",
        ReviewIssueType::DeadCode => "dead-code",
        ReviewIssueType::SpecIntentMismatch => "spec-intent-mismatch",
        ReviewIssueType::ArchitectureConcern => "architecture-concern",
    }
}

fn issue_type_from_str(s: &str) -> SqResult<ReviewIssueType> {
    Ok(match s {
        "over-engineering" => ReviewIssueType::OverEngineering,
        "missing-error-handling" => ReviewIssueType::MissingErrorHandling,
        "pattern-violation" => ReviewIssueType::PatternViolation,
        "dead-code" => ReviewIssueType::DeadCode,
        "spec-intent-mismatch" => ReviewIssueType::SpecIntentMismatch,
        "architecture-concern" => ReviewIssueType::ArchitectureConcern,
        other => return Err(StoreError::MalformedArtifact(format!("unknown review issue type '{other}'")).into()),
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct IssuePayload {
    issue_type: String,
    description: String,
    suggestion: String,
}

impl RunStore {
    /// Sets the review result for one task id (or the run-wide,
    /// cross-task scope when `task_id` is `None`): replaces any
    /// previously persisted issues in that exact scope, then inserts
    /// the new set. An empty `issues` slice clears that scope (review
    /// passed for it).
    pub fn set_review_result(&self, run_id: &str, task_id: Option<&str>, issues: &[ReviewIssue]) -> SqResult<()> {
        match task_id {
            Some(task_id) => {
                self.conn
                    .execute(
                        "DELETE FROM context WHERE run_id = ?1 AND entry_type = 'review_issue' AND task_id = ?2",
                        params![run_id, task_id],
                    )
                    .map_err(StoreError::Database)?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM context WHERE run_id = ?1 AND entry_type = 'review_issue' AND task_id IS NULL",
                        params![run_id],
                    )
                    .map_err(StoreError::Database)?;
            }
        }

        for issue in issues {
            let payload = IssuePayload {
                issue_type: issue_type_str(issue.issue_type).to_string(),
                description: issue.description.clone(),
                suggestion: issue.suggestion.clone(),
            };
            let content = serde_json::to_string(&payload).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
            self.conn
                .execute(
                    "INSERT INTO context (id, run_id, created_at, entry_type, content, task_id, loop_id, file, line)
                     VALUES (?1,?2,?3,'review_issue',?4,?5,NULL,?6,?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        run_id,
                        Utc::now().to_rfc3339(),
                        content,
                        issue.task_id,
                        issue.file,
                        issue.line,
                    ],
                )
                .map_err(StoreError::Database)?;
        }
        Ok(())
    }

    /// Per-loop variant of [`RunStore::set_review_result`] for
    /// checkpoint reviews — the spec's own decision (Open Question,
    /// recorded in DESIGN.md) treats these identically to build
    /// reviews, so this simply scopes by the loop's task ids.
    pub fn set_loop_review_result(&self, run_id: &str, task_ids: &[String], issues: &[ReviewIssue]) -> SqResult<()> {
        for task_id in task_ids {
            let scoped: Vec<ReviewIssue> = issues
                .iter()
                .filter(|i| i.task_id.as_deref() == Some(task_id.as_str()))
                .cloned()
                .collect();
            self.set_review_result(run_id, Some(task_id), &scoped)?;
        }
        Ok(())
    }

    pub fn load_review_issues(&self, run_id: &str, task_id: Option<&str>) -> SqResult<Vec<ReviewIssue>> {
        let mut stmt = match task_id {
            Some(_) => self
                .conn
                .prepare(
                    "SELECT content, task_id, file, line FROM context
                     WHERE run_id = ?1 AND entry_type = 'review_issue' AND task_id = ?2",
                )
                .map_err(StoreError::Database)?,
            None => self
                .conn
                .prepare("SELECT content, task_id, file, line FROM context WHERE run_id = ?1 AND entry_type = 'review_issue'")
                .map_err(StoreError::Database)?,
        };

        let rows = if let Some(task_id) = task_id {
            stmt.query_map(params![run_id, task_id], Self::row_to_raw_issue)
        } else {
            stmt.query_map(params![run_id], Self::row_to_raw_issue)
        }
        .map_err(StoreError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            let (content, task_id, file, line) = row.map_err(StoreError::Database)?;
            let payload: IssuePayload = serde_json::from_str(&content).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?;
            out.push(ReviewIssue {
                task_id,
                file,
                line,
                issue_type: issue_type_from_str(&payload.issue_type)?,
                description: payload.description,
                suggestion: payload.suggestion,
            });
        }
        Ok(out)
    }

    fn row_to_raw_issue(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(String, Option<String>, Option<String>, Option<u32>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    /// Passed iff zero issues persisted for the scope (spec §4.2.5).
    pub fn review_passed(&self, run_id: &str, task_id: Option<&str>) -> SqResult<bool> {
        Ok(self.load_review_issues(run_id, task_id)?.is_empty())
    }

    pub fn codebase_analysis_context_count(&self, run_id: &str) -> SqResult<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM context WHERE run_id = ?1 AND entry_type = ?2",
                params![run_id, "codebase_analysis"],
                |row| row.get(0),
            )
            .map_err(StoreError::Database)?;
        Ok(count as u64)
    }

    pub fn set_codebase_analysis(&self, run_id: &str, analysis_json: &str) -> SqResult<()> {
        self.conn
            .execute(
                "UPDATE runs SET codebase_analysis_json = ?2 WHERE id = ?1",
                params![run_id, analysis_json],
            )
            .map_err(StoreError::Database)?;
        self.append_context(run_id, ContextType::CodebaseAnalysis, analysis_json.to_string(), None, None, None, None)?;
        Ok(())
    }
}
