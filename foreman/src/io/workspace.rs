//! Per-task checkouts under `<workspaces_root>/<task_id>`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::ids::validate_id;
use crate::core::types::Task;
use crate::error::FleetError;
use crate::io::git::Git;

/// Clone or refresh the task's workspace so it sits on `task.branch` at the
/// remote tip.
///
/// Any git failure is reported as [`FleetError::Repo`].
#[instrument(skip_all, fields(task_id = %task.task_id, branch = %task.branch))]
pub fn ensure_workspace(root: &Path, task: &Task) -> Result<PathBuf> {
    validate_id(&task.task_id)?;
    fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let dest = root.join(&task.task_id);
    let result = if dest.exists() {
        refresh(&dest, &task.branch)
    } else {
        clone_fresh(&task.repo, &task.branch, &dest)
    };
    result.map_err(|err| {
        warn!(err = %format!("{err:#}"), "workspace sync failed");
        FleetError::Repo {
            task_id: task.task_id.clone(),
            message: format!("{err:#}"),
        }
    })?;
    Ok(dest)
}

fn clone_fresh(repo: &str, branch: &str, dest: &Path) -> Result<()> {
    info!(repo, "cloning workspace");
    if let Err(err) = Git::clone_branch(repo, branch, dest) {
        if dest.exists() {
            let _ = fs::remove_dir_all(dest);
        }
        return Err(err);
    }
    Ok(())
}

fn refresh(dest: &Path, branch: &str) -> Result<()> {
    let git = Git::new(dest);
    if !git.is_repo() {
        anyhow::bail!("{} exists but is not a git checkout", dest.display());
    }
    debug!("refreshing workspace");
    git.fetch_branch(branch)?;
    if git.current_branch().ok().as_deref() != Some(branch) {
        if git.branch_exists(branch)? {
            git.checkout_branch(branch)?;
        } else {
            git.checkout_new_branch_at(branch, "FETCH_HEAD")?;
            return Ok(());
        }
    }
    git.fast_forward_to_fetch_head()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{GitFixture, task_in};

    fn task_for(fixture: &GitFixture, id: &str, branch: &str) -> Task {
        let mut task = task_in(id, "Build");
        task.repo = fixture.url();
        task.branch = branch.to_string();
        task
    }

    #[test]
    fn clones_then_fast_forwards() {
        let fixture = GitFixture::new().expect("fixture");
        let workspaces = tempfile::tempdir().expect("tempdir");
        let task = task_for(&fixture, "t1", "main");

        let ws = ensure_workspace(workspaces.path(), &task).expect("clone");
        assert!(ws.join("README.md").exists());

        fixture.commit_file("NEW.md", "new\n").expect("commit");
        ensure_workspace(workspaces.path(), &task).expect("refresh");
        assert!(ws.join("NEW.md").exists());
        assert_eq!(
            Git::new(&ws).head_sha().expect("sha"),
            fixture.git().head_sha().expect("sha")
        );
    }

    #[test]
    fn switches_to_task_branch() {
        let fixture = GitFixture::new().expect("fixture");
        fixture.create_branch("feature").expect("branch");
        let workspaces = tempfile::tempdir().expect("tempdir");

        let ws = ensure_workspace(workspaces.path(), &task_for(&fixture, "t1", "main"))
            .expect("clone");
        ensure_workspace(workspaces.path(), &task_for(&fixture, "t1", "feature"))
            .expect("switch");
        assert_eq!(Git::new(&ws).current_branch().expect("branch"), "feature");
    }

    #[test]
    fn missing_branch_is_repo_error_and_leaves_nothing() {
        let fixture = GitFixture::new().expect("fixture");
        let workspaces = tempfile::tempdir().expect("tempdir");
        let err = ensure_workspace(workspaces.path(), &task_for(&fixture, "t1", "nope"))
            .expect_err("bad branch");
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::Repo { task_id, .. }) if task_id == "t1"
        ));
        assert!(!workspaces.path().join("t1").exists());
    }

    #[test]
    fn non_repo_directory_is_repo_error() {
        let fixture = GitFixture::new().expect("fixture");
        let workspaces = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(workspaces.path().join("t1")).expect("dir");
        let err = ensure_workspace(workspaces.path(), &task_for(&fixture, "t1", "main"))
            .expect_err("not a repo");
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::Repo { .. })
        ));
    }
}
