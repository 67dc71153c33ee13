//! Completion-marker detection (spec §6): "Presence is
//! substring-sufficient; position is irrelevant."
//!
//! Simpler than the donor's regex-based `signals/parser.rs` (which
//! parses `<progress>`/`<blocker>`/`<pivot>` tags out of arbitrary
//! positions in text) — spec markers are bare literal substrings, so
//! plain `str::contains` is the correct, idiomatic match rather than a
//! compiled regex.

pub const ANALYZE_COMPLETE: &str = "ANALYZE_COMPLETE";
pub const ENUMERATE_COMPLETE: &str = "ENUMERATE_COMPLETE";
pub const PLAN_COMPLETE: &str = "PLAN_COMPLETE";
pub const REVIEW_COMPLETE: &str = "REVIEW_COMPLETE";
pub const ITERATION_DONE: &str = "ITERATION_DONE";
pub const TASK_COMPLETE: &str = "TASK_COMPLETE";
pub const TASK_STUCK: &str = "TASK_STUCK";
pub const CONFLICT_RESOLVED: &str = "CONFLICT_RESOLVED";
const CONFLICT_FAILED_PREFIX: &str = "CONFLICT_FAILED:";

pub fn contains_marker(text: &str, marker: &str) -> bool {
    text.contains(marker)
}

/// Returns the `<message>` from a `CONFLICT_FAILED: <message>` marker,
/// if present.
pub fn conflict_failed_message(text: &str) -> Option<String> {
    let idx = text.find(CONFLICT_FAILED_PREFIX)?;
    let rest = &text[idx + CONFLICT_FAILED_PREFIX.len()..];
    let message = rest.lines().next().unwrap_or("").trim();
    Some(message.to_string())
}
