//! Test-only builders, fakes and fixtures.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;

use crate::core::types::{GuardResult, Task};
use crate::core::workflow::{DEFAULT_INITIAL_STATE, Guard, GuardSpec, StateSpec, Workflow};
use crate::io::git::Git;
use crate::io::guards::GuardRunner;
use crate::io::procfs::ProcessProbe;

/// `queued → Build → (Review | Quarantine)` with one `unit_tests` guard on
/// `Build` running `guard_command`.
pub fn build_review_workflow(guard_command: &str) -> Workflow {
    let mut states = BTreeMap::new();
    states.insert(
        DEFAULT_INITIAL_STATE.to_string(),
        StateSpec {
            next: Some("Build".to_string()),
            ..StateSpec::default()
        },
    );
    states.insert(
        "Build".to_string(),
        StateSpec {
            guards: vec!["unit_tests".to_string()],
            on_pass: Some("Review".to_string()),
            on_fail: Some("Quarantine".to_string()),
            next: None,
        },
    );
    states.insert("Review".to_string(), StateSpec::default());
    states.insert("Quarantine".to_string(), StateSpec::default());

    let mut guards = BTreeMap::new();
    guards.insert(
        "unit_tests".to_string(),
        GuardSpec::Command(guard_command.to_string()),
    );

    Workflow {
        name: "review".to_string(),
        initial: DEFAULT_INITIAL_STATE.to_string(),
        states,
        guards,
    }
}

/// Unowned task on a placeholder repo.
pub fn task_in(task_id: &str, state: &str) -> Task {
    Task::new(task_id, "/srv/git/example.git", "main", state)
}

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Exit(i32),
    Interrupt,
}

/// Guard runner with canned outcomes per guard name. Unscripted guards pass.
#[derive(Debug, Default)]
pub struct ScriptedGuardRunner {
    outcomes: HashMap<String, Scripted>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedGuardRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit(mut self, guard: &str, code: i32) -> Self {
        self.outcomes.insert(guard.to_string(), Scripted::Exit(code));
        self
    }

    /// Behave as if shutdown killed this guard mid-run.
    pub fn interrupt(mut self, guard: &str) -> Self {
        self.outcomes.insert(guard.to_string(), Scripted::Interrupt);
        self
    }

    /// `"<guard>: <rendered command>"` per invocation, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl GuardRunner for ScriptedGuardRunner {
    fn run_guard(&self, guard: &Guard, _cwd: &Path) -> GuardResult {
        self.calls
            .borrow_mut()
            .push(format!("{}: {}", guard.name, guard.command));
        let started = Utc::now();
        let (rc, interrupted) = match self.outcomes.get(&guard.name) {
            Some(Scripted::Exit(code)) => (Some(*code), false),
            Some(Scripted::Interrupt) => (None, true),
            None => (Some(0), false),
        };
        GuardResult {
            guard: guard.name.clone(),
            cmd: guard.command.clone(),
            ok: rc == Some(0),
            rc,
            stdout: format!("{} ran\n", guard.name),
            stderr: String::new(),
            started,
            ended: Utc::now(),
            timed_out: false,
            interrupted,
        }
    }
}

/// Process probe with a fixed set of live pids.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    alive: HashSet<u32>,
}

impl FakeProbe {
    pub fn alive(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            alive: pids.into_iter().collect(),
        }
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

/// A local origin repository with one commit on `main`.
pub struct GitFixture {
    temp: TempDir,
    git: Git,
}

impl GitFixture {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let origin = temp.path().join("origin");
        fs::create_dir_all(&origin)?;
        let git = Git::init(&origin, "main")?;
        git.set_config("user.name", "Fixture")?;
        git.set_config("user.email", "fixture@example.com")?;
        git.set_config("commit.gpgsign", "false")?;
        let fixture = Self { temp, git };
        fixture.commit_file("README.md", "fixture\n")?;
        Ok(fixture)
    }

    /// Clone URL (a local path).
    pub fn url(&self) -> String {
        self.git.workdir().display().to_string()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Write `name` in the origin and commit it on the current branch.
    pub fn commit_file(&self, name: &str, contents: &str) -> Result<()> {
        fs::write(self.git.workdir().join(name), contents)?;
        self.git.commit_all(&format!("add {name}"))?;
        Ok(())
    }

    pub fn create_branch(&self, branch: &str) -> Result<()> {
        self.git.create_branch(branch)
    }
}
