//! The FSM engine: run a state's guards and follow the resulting edge.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::transition::{Transition, all_guards_ok, resolve_next_state};
use crate::core::types::{Evidence, EvidenceKind, GuardResult, Task};
use crate::core::workflow::{Guard, Workflow};
use crate::error::FleetError;
use crate::io::evidence::EvidenceWriter;
use crate::io::guards::{GuardContext, GuardRunner, render_command};
use crate::io::kv::KvStore;
use crate::io::task_store::TaskStore;
use crate::schedule::Shutdown;

/// Advances tasks one edge at a time.
pub struct Engine<S, R> {
    store: TaskStore<S>,
    runner: R,
    evidence: EvidenceWriter,
    guard_timeout: Duration,
    shutdown: Shutdown,
}

impl<S: KvStore, R: GuardRunner> Engine<S, R> {
    pub fn new(store: TaskStore<S>, runner: R, evidence: EvidenceWriter, guard_timeout: Duration) -> Self {
        Self {
            store,
            runner,
            evidence,
            guard_timeout,
            shutdown: Shutdown::new(),
        }
    }

    /// Stop between guards once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &TaskStore<S> {
        &self.store
    }

    /// Run every guard bound to `task.state` in `workspace`, move the task
    /// along the resolved edge and persist it.
    ///
    /// Guard failures are data in the returned [`Transition`]. Errors are
    /// reserved for storage failures, a state the workflow does not declare,
    /// and shutdown ([`FleetError::Cancelled`], in which case nothing is
    /// persisted).
    #[instrument(skip_all, fields(task_id = %task.task_id, state = %task.state))]
    pub fn advance(&self, task: &mut Task, workflow: &Workflow, workspace: &Path) -> Result<Transition> {
        if !workflow.contains_state(&task.state) {
            return Err(anyhow!(
                "task {} is in state '{}' which workflow '{}' does not declare",
                task.task_id,
                task.state,
                workflow.name
            ));
        }
        let from = task.state.clone();
        let context = GuardContext::for_task(task, workspace);

        let mut results = Vec::new();
        for guard in workflow.guards_for(&from, self.guard_timeout) {
            if self.shutdown.is_requested() {
                return Err(FleetError::Cancelled(format!("before guard {}", guard.name)).into());
            }
            let result = self.run_one(&guard, &context, workspace);
            if result.interrupted {
                warn!(guard = %guard.name, "guard interrupted, discarding partial results");
                return Err(FleetError::Cancelled(format!("guard {} interrupted", guard.name)).into());
            }
            results.push(result);
        }

        let ok = all_guards_ok(&results);
        let to = resolve_next_state(workflow.state(&from), &from, ok);

        for result in &results {
            let path = self.evidence.persist(&task.task_id, &from, result)?;
            task.append_evidence(Evidence::new(
                EvidenceKind::GuardResult,
                path.display().to_string(),
            ));
        }
        task.state = to.clone();
        task.meta.insert(
            "last_transition".to_string(),
            json!({ "from": from, "to": to, "ok": ok, "at": Utc::now() }),
        );
        task.touch();
        self.store.write_task(task)?;

        info!(from = %from, to = %to, ok, guards = results.len(), "task advanced");
        Ok(Transition {
            task_id: task.task_id.clone(),
            from,
            to,
            ok,
            guard_results: results,
        })
    }

    fn run_one(&self, guard: &Guard, context: &GuardContext, workspace: &Path) -> GuardResult {
        match render_command(&guard.command, context) {
            Ok(command) => {
                let rendered = Guard {
                    command,
                    ..guard.clone()
                };
                self.runner.run_guard(&rendered, workspace)
            }
            Err(err) => {
                warn!(guard = %guard.name, err = %format!("{err:#}"), "guard template failed to render");
                GuardResult::not_started(
                    &guard.name,
                    &guard.command,
                    &format!("template render failed: {err:#}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::kv::FsStore;
    use crate::test_support::{ScriptedGuardRunner, build_review_workflow, task_in};

    fn engine(root: &Path, runner: ScriptedGuardRunner) -> Engine<FsStore, ScriptedGuardRunner> {
        Engine::new(
            TaskStore::new(FsStore::new(root.join("tasks"))),
            runner,
            EvidenceWriter::new(root.join("evidence")),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn passing_guard_follows_on_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedGuardRunner::new().exit("unit_tests", 0);
        let engine = engine(temp.path(), runner);
        let mut task = task_in("t1", "Build");

        let transition = engine
            .advance(&mut task, &build_review_workflow("make test"), temp.path())
            .expect("advance");

        assert_eq!((transition.from.as_str(), transition.to.as_str()), ("Build", "Review"));
        assert!(transition.ok);
        assert_eq!(task.state, "Review");
        assert_eq!(engine.store().read_task("t1").expect("read").state, "Review");
        assert_eq!(task.evidence.len(), 1);
        assert_eq!(task.evidence[0].kind, EvidenceKind::GuardResult);
        assert!(Path::new(&task.evidence[0].content).exists());
        assert_eq!(task.meta["last_transition"]["to"], "Review");
    }

    #[test]
    fn failing_guard_follows_on_fail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path(), ScriptedGuardRunner::new().exit("unit_tests", 1));
        let mut task = task_in("t1", "Build");
        let transition = engine
            .advance(&mut task, &build_review_workflow("make test"), temp.path())
            .expect("advance");
        assert!(!transition.ok);
        assert_eq!(transition.to, "Quarantine");
        assert_eq!(transition.failing_guards().count(), 1);
    }

    #[test]
    fn runs_exactly_the_state_guards_with_rendered_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedGuardRunner::new().exit("unit_tests", 0);
        let engine = engine(temp.path(), runner);
        let mut task = task_in("t9", "Build");
        engine
            .advance(&mut task, &build_review_workflow("test {{ task_id }}"), temp.path())
            .expect("advance");
        assert_eq!(engine.runner.calls(), vec!["unit_tests: test t9".to_string()]);
    }

    #[test]
    fn guardless_state_follows_next() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path(), ScriptedGuardRunner::new());
        let mut task = task_in("t1", "queued");
        let transition = engine
            .advance(&mut task, &build_review_workflow("true"), temp.path())
            .expect("advance");
        assert!(transition.ok);
        assert_eq!(transition.to, "Build");
        assert!(engine.runner.calls().is_empty());
    }

    #[test]
    fn bad_template_is_a_failed_guard_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path(), ScriptedGuardRunner::new().exit("unit_tests", 0));
        let mut task = task_in("t1", "Build");
        let transition = engine
            .advance(&mut task, &build_review_workflow("echo {{ missing }}"), temp.path())
            .expect("advance");
        assert!(!transition.ok);
        assert_eq!(transition.to, "Quarantine");
        assert!(engine.runner.calls().is_empty());
    }

    #[test]
    fn staying_in_a_state_keeps_every_earlier_guard_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut workflow = build_review_workflow("make test");
        if let Some(build) = workflow.states.get_mut("Build") {
            build.on_fail = None;
        }
        let mut task = task_in("t1", "Build");

        for code in [7, 9] {
            let engine = engine(temp.path(), ScriptedGuardRunner::new().exit("unit_tests", code));
            let transition = engine
                .advance(&mut task, &workflow, temp.path())
                .expect("advance");
            assert_eq!(transition.to, "Build");
        }

        let stored = engine(temp.path(), ScriptedGuardRunner::new())
            .store()
            .read_task("t1")
            .expect("read");
        assert_eq!(stored.evidence.len(), 2);
        assert_ne!(stored.evidence[0].content, stored.evidence[1].content);
        let codes: Vec<Option<i32>> = stored
            .evidence
            .iter()
            .map(|evidence| {
                let artifact: GuardResult = serde_json::from_str(
                    &std::fs::read_to_string(&evidence.content).expect("read artifact"),
                )
                .expect("parse artifact");
                artifact.rc
            })
            .collect();
        assert_eq!(codes, vec![Some(7), Some(9)]);
    }

    #[test]
    fn undeclared_state_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path(), ScriptedGuardRunner::new());
        let mut task = task_in("t1", "Limbo");
        assert!(
            engine
                .advance(&mut task, &build_review_workflow("true"), temp.path())
                .is_err()
        );
    }

    #[test]
    fn interrupted_guard_persists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path(), ScriptedGuardRunner::new().interrupt("unit_tests"));
        let mut task = task_in("t1", "Build");
        engine.store().write_task(&task).expect("seed");

        let err = engine
            .advance(&mut task, &build_review_workflow("true"), temp.path())
            .expect_err("cancelled");
        assert!(crate::error::is_cancelled(&err));
        let stored = engine.store().read_task("t1").expect("read");
        assert_eq!(stored.state, "Build");
        assert!(stored.evidence.is_empty());
        assert!(!temp.path().join("evidence").exists());
    }
}
