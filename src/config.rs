//! Run configuration: resolves defaults -> `.sq.toml` -> CLI flags.
//!
//! Generalizes the donor's `config.rs` (`Config::new`, `ensure_directories`)
//! from a single fixed project layout to the flag set in spec §6.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::effort::EffortLevel;
use crate::errors::SqResult;

const DEFAULT_STATE_DIR: &str = ".sq";
const DEFAULT_AGENT_CMD: &str = "claude";
const DEFAULT_MAX_LOOPS: usize = 4;
const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Optional `.sq.toml` file in the project root. Every field is optional;
/// CLI flags always take precedence over it.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub effort: Option<EffortLevel>,
    pub max_loops: Option<usize>,
    pub max_iterations: Option<u32>,
    pub agent_cmd: Option<String>,
}

impl ConfigFile {
    fn load(project_dir: &Path) -> ConfigFile {
        let path = project_dir.join(".sq.toml");
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => ConfigFile::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub spec_path: PathBuf,
    pub effort: EffortLevel,
    pub max_loops: usize,
    pub max_iterations: u32,
    pub state_dir: PathBuf,
    pub resume: bool,
    pub reset: bool,
    pub dry_run: bool,
    pub no_tui: bool,
    pub no_worktrees: bool,
    pub debug: bool,
    pub agent_cmd: String,
}

/// Raw values collected from the CLI, before layering with `.sq.toml`.
pub struct ConfigArgs {
    pub spec_path: PathBuf,
    pub effort: Option<EffortLevel>,
    pub max_loops: Option<usize>,
    pub max_iterations: Option<u32>,
    pub state_dir: Option<PathBuf>,
    pub resume: bool,
    pub reset: bool,
    pub dry_run: bool,
    pub no_tui: bool,
    pub no_worktrees: bool,
    pub debug: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, args: ConfigArgs) -> SqResult<Self> {
        let project_dir = project_dir.canonicalize().unwrap_or(project_dir);
        let file = ConfigFile::load(&project_dir);

        let agent_cmd = std::env::var("SQ_AGENT_CMD")
            .ok()
            .or(file.agent_cmd)
            .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_string());

        let state_dir = args
            .state_dir
            .unwrap_or_else(|| project_dir.join(DEFAULT_STATE_DIR));

        let config = Config {
            spec_path: args.spec_path,
            effort: args.effort.or(file.effort).unwrap_or_default(),
            max_loops: args.max_loops.or(file.max_loops).unwrap_or(DEFAULT_MAX_LOOPS),
            max_iterations: args
                .max_iterations
                .or(file.max_iterations)
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            state_dir,
            resume: args.resume,
            reset: args.reset,
            dry_run: args.dry_run,
            no_tui: args.no_tui,
            no_worktrees: args.no_worktrees,
            debug: args.debug,
            agent_cmd,
            project_dir,
        };

        if config.reset && config.state_dir.exists() {
            fs::remove_dir_all(&config.state_dir)?;
        }
        config.ensure_directories()?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(self.state_dir.join("worktrees"))?;
        if self.debug {
            fs::create_dir_all(self.state_dir.join("debug"))?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn worktree_dir(&self, loop_id: &str) -> PathBuf {
        self.state_dir.join("worktrees").join(loop_id)
    }

    pub fn debug_trace_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join("debug").join(run_id).join("trace.json")
    }

    /// True when `project_dir` contains nothing but ignorable entries
    /// (`.git`, `.sq`, the spec file, and markdown docs). Used to latch
    /// `Run.was_empty_project` at run start (spec §4.1 step 1).
    pub fn project_is_empty(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.project_dir) else {
            return true;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".git" || name == ".sq" || name.starts_with('.') {
                continue;
            }
            if name.ends_with(".md") {
                continue;
            }
            if entry.path() == self.spec_path {
                continue;
            }
            return false;
        }
        true
    }
}
