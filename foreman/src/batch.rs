//! Batch FSM driver: one pass over every actionable task, then a digest.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::heartbeat::Thresholds;
use crate::core::workflow::Workflow;
use crate::error::is_cancelled;
use crate::fsm::Engine;
use crate::io::digest::{Digest, DigestEntry, StaleAgent, write_digest};
use crate::io::guards::GuardRunner;
use crate::io::heartbeat_store::CommsLayout;
use crate::io::kv::KvStore;
use crate::io::procfs::ProcProbe;
use crate::io::task_store::TaskFilter;
use crate::io::workspace::ensure_workspace;
use crate::schedule::Pass;
use crate::watch::scan_stale;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub workspaces_root: PathBuf,
    pub digest_dir: PathBuf,
    /// Only process tasks bound to this workflow (or unbound).
    pub workflow_filter: Option<String>,
    /// Include stale agents from this comms root in the digest.
    pub fleet_health: Option<(CommsLayout, Thresholds)>,
}

pub struct BatchDriver<S, R> {
    engine: Engine<S, R>,
    workflow: Workflow,
    options: BatchOptions,
}

impl<S: KvStore, R: GuardRunner> BatchDriver<S, R> {
    pub fn new(engine: Engine<S, R>, workflow: Workflow, options: BatchOptions) -> Self {
        Self {
            engine,
            workflow,
            options,
        }
    }

    pub fn engine(&self) -> &Engine<S, R> {
        &self.engine
    }

    /// Advance every task sitting in an actionable state exactly once and
    /// write the digest.
    ///
    /// Per-task failures (unreadable record, repo sync failure) become failed
    /// digest entries. Shutdown surfaces as [`FleetError::Cancelled`] after
    /// the digest for the completed part of the pass is written.
    #[instrument(skip_all, fields(workflow = %self.workflow.name))]
    pub fn run_pass(&mut self) -> Result<Digest> {
        let filter = TaskFilter {
            states: Some(self.workflow.actionable_states()),
            workflow: self.options.workflow_filter.clone(),
            ..TaskFilter::default()
        };
        let mut entries = Vec::new();
        let mut cancelled = None;

        for item in self.engine.store().list_tasks(filter)? {
            let mut task = match item {
                Ok(task) => task,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "skipping unreadable task");
                    continue;
                }
            };
            let workspace = match ensure_workspace(&self.options.workspaces_root, &task) {
                Ok(workspace) => workspace,
                Err(err) => {
                    warn!(task_id = %task.task_id, err = %format!("{err:#}"), "workspace unavailable, task stays put");
                    entries.push(DigestEntry::failure(&task.task_id, &task.state, format!("{err:#}")));
                    continue;
                }
            };
            match self.engine.advance(&mut task, &self.workflow, &workspace) {
                Ok(transition) => entries.push(DigestEntry::from_transition(&transition)),
                Err(err) if is_cancelled(&err) => {
                    cancelled = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(task_id = %task.task_id, err = %format!("{err:#}"), "advance failed");
                    entries.push(DigestEntry::failure(&task.task_id, &task.state, format!("{err:#}")));
                }
            }
        }

        let digest = Digest::new(&self.workflow.name, entries, self.stale_agents());
        write_digest(&self.options.digest_dir, &digest)?;
        info!(
            processed = digest.processed,
            moved = digest.moved,
            failed = digest.failed,
            "batch pass complete"
        );
        match cancelled {
            Some(err) => Err(err),
            None => Ok(digest),
        }
    }

    fn stale_agents(&self) -> Vec<StaleAgent> {
        let Some((layout, thresholds)) = &self.options.fleet_health else {
            return Vec::new();
        };
        scan_stale(layout, &ProcProbe, thresholds, Utc::now()).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "fleet health scan failed");
            Vec::new()
        })
    }
}

impl<S: KvStore, R: GuardRunner> Pass for BatchDriver<S, R> {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn run_once(&mut self) -> Result<()> {
        self.run_pass().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::io::evidence::EvidenceWriter;
    use crate::io::kv::FsStore;
    use crate::io::task_store::TaskStore;
    use crate::test_support::{ScriptedGuardRunner, build_review_workflow, task_in};

    fn driver(root: &std::path::Path) -> BatchDriver<FsStore, ScriptedGuardRunner> {
        let engine = Engine::new(
            TaskStore::new(FsStore::new(root.join("tasks"))),
            ScriptedGuardRunner::new().exit("unit_tests", 0),
            EvidenceWriter::new(root.join("evidence")),
            Duration::from_secs(60),
        );
        BatchDriver::new(
            engine,
            build_review_workflow("true"),
            BatchOptions {
                workspaces_root: root.join("workspaces"),
                digest_dir: root.join("digests"),
                workflow_filter: None,
                fleet_health: None,
            },
        )
    }

    #[test]
    fn repo_failure_is_a_failed_entry_and_task_stays() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut driver = driver(temp.path());
        let mut task = task_in("t1", "Build");
        task.repo = temp.path().join("no-such-repo").display().to_string();
        driver.engine().store().write_task(&task).expect("seed");

        let digest = driver.run_pass().expect("pass");
        assert_eq!(digest.processed, 1);
        let entry = &digest.entries[0];
        assert!(!entry.ok);
        assert_eq!((entry.from.as_str(), entry.to.as_str()), ("Build", "Build"));
        assert!(entry.error.is_some());
        assert_eq!(driver.engine().store().read_task("t1").expect("read").state, "Build");
        assert!(temp.path().join("digests").join("latest.md").exists());
    }

    #[test]
    fn non_actionable_and_foreign_workflow_tasks_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut driver = driver(temp.path());
        driver.options.workflow_filter = Some("review".to_string());
        let store = driver.engine().store();
        store.write_task(&task_in("queued-1", "queued")).expect("seed");
        store.write_task(&task_in("review-1", "Review")).expect("seed");
        let mut foreign = task_in("other-1", "Build");
        foreign.workflow = Some("deploy".to_string());
        store.write_task(&foreign).expect("seed");

        let digest = driver.run_pass().expect("pass");
        assert_eq!(digest.processed, 0);
    }
}
