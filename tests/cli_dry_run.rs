//! CLI-level smoke tests (spec §6): drive the compiled `sq` binary
//! itself, the way the donor's own top-level integration suite shells
//! out to its binary rather than calling library functions directly.
//!
//! `tests/integration_test.rs` already exercises the Phase Engine in
//! depth at the library boundary (seeding the Run Store the way the
//! out-of-scope tool host would); these tests only need to prove the
//! binary wires CLI flags, `.sq.toml`/env config, and the driver
//! together correctly, without requiring a real tool host to advance
//! past `enumerate` — a stub agent can't write tasks the way the tool
//! host does, so these stay bounded by a deliberately low cost limit
//! instead of trying to walk a full run to completion.

use std::fs;

use assert_cmd::Command;
use predicates::str::contains;

/// A stub agent that never emits a completion marker, so whichever
/// phase calls it keeps retrying; `total_cost_usd` is nonzero so the
/// retries are bounded by the per-phase cost limit rather than looping
/// forever.
fn write_stub_agent(dir: &std::path::Path, cost_per_call: f64) -> std::path::PathBuf {
    let script = dir.join("stub-agent.sh");
    let body = format!(
        "#!/bin/sh\ncat > /dev/null\necho '{{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"is_error\":false,\"total_cost_usd\":{cost_per_call}}}'\n"
    );
    fs::write(&script, body).unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();
    script
}

#[test]
fn missing_spec_file_exits_nonzero() {
    let project = tempfile::tempdir().unwrap();

    let mut cmd = Command::cargo_bin("sq").unwrap();
    cmd.current_dir(project.path()).args(["--spec", "does-not-exist.md", "--no-tui", "--no-worktrees"]);

    cmd.assert().failure();
}

/// A non-empty project forces `analyze` to actually invoke the agent
/// (the empty-project shortcut in spec §4.2.1 only applies to a bare
/// directory), so this exercises the real agent-subprocess path, cost
/// recording, and the driver's cost-limit halt end to end through the
/// compiled binary.
#[test]
fn low_effort_phase_cost_limit_halts_the_run_with_exit_code_one() {
    let project = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let spec_path = project.path().join("spec.md");
    fs::write(&spec_path, "# spec\nbuild a greeter\n").unwrap();
    fs::write(project.path().join("main.rs"), "fn main() {}").unwrap();
    // low effort's per_phase_max_usd is $2.00 (driver::cost_limits_for);
    // two $1.20 retries of `analyze` cross it on the third limit check.
    let agent_cmd = write_stub_agent(scripts.path(), 1.2);

    let mut cmd = Command::cargo_bin("sq").unwrap();
    cmd.current_dir(project.path())
        .env("SQ_AGENT_CMD", &agent_cmd)
        .args([
            "--spec",
            spec_path.to_str().unwrap(),
            "--effort",
            "low",
            "--no-tui",
            "--no-worktrees",
        ]);

    cmd.assert().code(1).stdout(contains("finished in phase 'complete' (exit 1)"));
    assert!(project.path().join(".sq").join("state.db").exists());
}

#[test]
fn reset_flag_wipes_prior_state_before_starting() {
    let project = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let spec_path = project.path().join("spec.md");
    fs::write(&spec_path, "# spec\nbuild a greeter\n").unwrap();
    fs::write(project.path().join("main.rs"), "fn main() {}").unwrap();
    let agent_cmd = write_stub_agent(scripts.path(), 1.2);

    let state_dir = project.path().join(".sq");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(state_dir.join("stale-marker"), "x").unwrap();

    let mut cmd = Command::cargo_bin("sq").unwrap();
    cmd.current_dir(project.path())
        .env("SQ_AGENT_CMD", &agent_cmd)
        .args([
            "--spec",
            spec_path.to_str().unwrap(),
            "--effort",
            "low",
            "--no-tui",
            "--no-worktrees",
            "--reset",
        ]);

    cmd.assert().code(1);
    assert!(!state_dir.join("stale-marker").exists());
}
