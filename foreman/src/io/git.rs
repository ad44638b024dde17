//! Git adapter for task workspaces.
//!
//! Workspaces are plain clones of the task's repo, kept on the task's branch
//! and fast-forwarded before each guard run. Every call shells out to `git`
//! with prompts disabled.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// `git` bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `repo` at `branch` into `dest`. Runs from `dest`'s parent.
    #[instrument(skip_all, fields(repo, branch))]
    pub fn clone_branch(repo: &str, branch: &str, dest: &Path) -> Result<Git> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
        let dest_arg = dest.to_string_lossy();
        debug!(dest = %dest.display(), "cloning");
        Git::new(parent).run_checked(&[
            "clone", "--quiet", "--branch", branch, "--", repo, &dest_arg,
        ])?;
        Ok(Git::new(dest))
    }

    /// Initialise an empty repository with a first branch name.
    pub fn init(workdir: impl Into<PathBuf>, branch: &str) -> Result<Git> {
        let git = Git::new(workdir);
        git.run_checked(&["init", "--quiet", "--initial-branch", branch])?;
        debug!(workdir = %git.workdir.display(), branch, "initialised repository");
        Ok(git)
    }

    /// True if `workdir` is the top of a work tree.
    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            warn!(workdir = %self.workdir.display(), "workspace is on a detached HEAD");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        self.run_capture(&["rev-parse", "HEAD"])
    }

    /// True if `refs/heads/<branch>` exists locally.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let local_ref = format!("refs/heads/{branch}");
        let lookup = self.run(&["rev-parse", "--verify", "--quiet", &local_ref])?;
        Ok(lookup.status.success())
    }

    /// Create `branch` at HEAD without checking it out.
    pub fn create_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "--", branch]).map(drop)
    }

    /// Fetch `branch` from `origin` into FETCH_HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn fetch_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", "--quiet", "origin", branch]).map(drop)
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "--quiet", branch]).map(drop)
    }

    /// `git checkout -b <branch> <start>`.
    #[instrument(skip_all, fields(branch, start))]
    pub fn checkout_new_branch_at(&self, branch: &str, start: &str) -> Result<()> {
        debug!("branch missing locally, creating it");
        self.run_checked(&["checkout", "--quiet", "-b", branch, start]).map(drop)
    }

    /// Fast-forward the current branch to FETCH_HEAD. Diverged history fails.
    pub fn fast_forward_to_fetch_head(&self) -> Result<()> {
        self.run_checked(&["merge", "--quiet", "--ff-only", "FETCH_HEAD"]).map(drop)
    }

    /// Stage everything and commit it. A clean tree yields `Ok(false)`.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.run_checked(&["add", "--all"])?;
        let staged = self.run(&["diff", "--cached", "--quiet"])?;
        if staged.status.success() {
            debug!("tree clean, nothing to commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Repository-local `git config key value`.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", "--local", key, value]).map(drop)
    }

    /// Trimmed stdout of a successful command.
    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(anyhow!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
