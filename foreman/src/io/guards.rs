//! Guard executor: opaque shell commands whose exit code decides a transition.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::types::{GuardResult, Task};
use crate::core::workflow::Guard;
use crate::io::process::{run_command_with_timeout, shell_command};
use crate::schedule::Shutdown;

/// Values available to guard command templates.
#[derive(Debug, Clone, Serialize)]
pub struct GuardContext {
    pub task_id: String,
    pub repo: String,
    pub branch: String,
    pub state: String,
    pub workspace: String,
}

impl GuardContext {
    pub fn for_task(task: &Task, workspace: &Path) -> Self {
        Self {
            task_id: task.task_id.clone(),
            repo: task.repo.clone(),
            branch: task.branch.clone(),
            state: task.state.clone(),
            workspace: workspace.display().to_string(),
        }
    }
}

/// Render a command template. Unknown placeholders are an error.
pub fn render_command(template: &str, ctx: &GuardContext) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Ok(env.render_str(template, ctx)?)
}

/// Execution boundary for guards, mockable in tests.
pub trait GuardRunner {
    /// Run `guard.command` in `cwd`.
    ///
    /// Never fails: spawn errors, timeouts and non-zero exits are all
    /// reported through `ok == false`.
    fn run_guard(&self, guard: &Guard, cwd: &Path) -> GuardResult;
}

/// Runs guards through `sh -c` with bounded output capture.
#[derive(Debug, Clone)]
pub struct ShellGuardRunner {
    output_limit_bytes: usize,
    shutdown: Option<Shutdown>,
}

impl ShellGuardRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self {
            output_limit_bytes,
            shutdown: None,
        }
    }

    /// Kill in-flight guards when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl GuardRunner for ShellGuardRunner {
    #[instrument(skip_all, fields(guard = %guard.name, timeout_secs = guard.timeout.as_secs()))]
    fn run_guard(&self, guard: &Guard, cwd: &Path) -> GuardResult {
        let started = Utc::now();
        let mut cmd = shell_command(&guard.command);
        cmd.current_dir(cwd);

        let output = match run_command_with_timeout(
            cmd,
            guard.timeout,
            self.output_limit_bytes,
            self.shutdown.as_ref(),
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "guard could not run");
                return GuardResult::not_started(
                    &guard.name,
                    &guard.command,
                    &format!("guard could not run: {err:#}"),
                );
            }
        };

        let rc = if output.timed_out || output.cancelled {
            None
        } else {
            output.status.code()
        };
        let mut stderr = output.stderr.text("stderr");
        if output.timed_out {
            stderr.push_str(&format!(
                "\n[guard timed out after {}s]\n",
                guard.timeout.as_secs()
            ));
        }
        let result = GuardResult {
            guard: guard.name.clone(),
            cmd: guard.command.clone(),
            ok: rc == Some(0),
            rc,
            stdout: output.stdout.text("stdout"),
            stderr,
            started,
            ended: Utc::now(),
            timed_out: output.timed_out,
            interrupted: output.cancelled,
        };
        info!(ok = result.ok, rc = ?result.rc, timed_out = result.timed_out, "guard finished");
        result
    }
}
