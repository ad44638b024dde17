//! Assignment & evidence bridge between the task store and worker inboxes.
//!
//! Outbound, [`Bridge::assign`] hands queued tasks to workers as `task`
//! envelopes. Inbound, [`Bridge::apply_update`] folds `fsm_update` envelopes
//! back into task records and tells the supervisor with a `verify` envelope.
//! Updates merge last-write-wins on `state` and append-only on evidence, so
//! duplicate or reordered deliveries are harmless.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::envelope::{Envelope, MessageType};
use crate::core::ids::validate_id;
use crate::core::types::Task;
use crate::core::workflow::Workflow;
use crate::io::inbox::{Handlers, Inbox, Poller};
use crate::io::kv::KvStore;
use crate::io::task_store::{OwnerFilter, TaskFilter, TaskStore};

/// State given to stub records created for unknown task ids.
pub const ORPHAN_STATE: &str = "orphan";

pub struct Bridge<S> {
    store: TaskStore<S>,
    inbox: Inbox,
    identity: String,
    supervisor: String,
    workflow: Option<Workflow>,
}

impl<S: KvStore> Bridge<S> {
    pub fn new(
        store: TaskStore<S>,
        inbox: Inbox,
        identity: impl Into<String>,
        supervisor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            inbox,
            identity: identity.into(),
            supervisor: supervisor.into(),
            workflow: None,
        }
    }

    /// Reject incoming states this workflow does not declare.
    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn store(&self) -> &TaskStore<S> {
        &self.store
    }

    /// Hand queued, unowned tasks of `workflow` to `candidates` round-robin,
    /// oldest first. Returns how many were assigned.
    #[instrument(skip_all, fields(workflow = %workflow.name, candidates = candidates.len()))]
    pub fn assign(&self, workflow: &Workflow, candidates: &[String]) -> Result<usize> {
        if candidates.is_empty() {
            warn!("no candidate agents, nothing assigned");
            return Ok(0);
        }
        for agent in candidates {
            validate_id(agent).with_context(|| format!("candidate agent '{agent}'"))?;
        }

        let filter = TaskFilter {
            owner: OwnerFilter::Unowned,
            workflow: Some(workflow.name.clone()),
            ..TaskFilter::in_states([workflow.initial.as_str()])
        };
        let mut queued = Vec::new();
        for item in self.store.list_tasks(filter.clone())? {
            match item {
                Ok(task) => queued.push(task),
                Err(err) => warn!(err = %format!("{err:#}"), "skipping unreadable task"),
            }
        }
        queued.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let mut assigned = 0;
        for queued_task in queued {
            // Re-read right before the write; another bridge may have won it.
            let Some(mut task) = self.store.find_task(&queued_task.task_id)? else {
                continue;
            };
            if !filter.matches(&task) {
                debug!(task_id = %task.task_id, "no longer queued, skipping");
                continue;
            }
            let agent = &candidates[assigned % candidates.len()];
            task.owner = agent.clone();
            task.touch();
            self.store.write_task(&task)?;

            let envelope = Envelope::new(MessageType::Task, &self.identity, agent)
                .with_task_id(&task.task_id)
                .with_state(&task.state)
                .with_repo_path(&task.repo)
                .with_summary(task.intent());
            if let Err(err) = self.inbox.enqueue(agent, &envelope) {
                // Hand the task back so a later assign can retry it.
                task.owner.clear();
                task.touch();
                if let Err(restore) = self.store.write_task(&task) {
                    warn!(task_id = %task.task_id, err = %format!("{restore:#}"), "could not release task");
                }
                return Err(err.context(format!("hand task {} to {agent}", task.task_id)));
            }
            info!(task_id = %task.task_id, agent = %agent, "task assigned");
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Merge one `fsm_update` into its task and notify the supervisor.
    ///
    /// Unknown task ids get a stub record (`meta.stub = true`). Returns the
    /// task's state after the merge.
    #[instrument(skip_all, fields(from = %envelope.from, task_id = ?envelope.task_id))]
    pub fn apply_update(&self, envelope: &Envelope) -> Result<String> {
        let task_id = envelope
            .task_id
            .as_deref()
            .ok_or_else(|| anyhow!("{} envelope from {} has no task_id", envelope.kind.as_str(), envelope.from))?;
        validate_id(task_id).context("task_id")?;

        let mut task = match self.store.find_task(task_id)? {
            Some(task) => task,
            None => self.stub_task(task_id, envelope),
        };
        let previous_state = task.state.clone();

        let appended = envelope
            .evidence
            .iter()
            .filter(|evidence| task.append_evidence((*evidence).clone()))
            .count();

        if let Some(state) = envelope.state.as_deref() {
            match &self.workflow {
                Some(workflow) if !workflow.contains_state(state) => {
                    warn!(state, workflow = %workflow.name, "ignoring undeclared state");
                }
                _ => task.state = state.to_string(),
            }
        }
        if let Some(summary) = &envelope.summary {
            task.meta.insert(
                "last_update".to_string(),
                json!({ "from": envelope.from, "summary": summary, "at": Utc::now() }),
            );
        }
        task.touch();
        self.store.write_task(&task)?;

        let verify = Envelope::new(MessageType::Verify, &self.identity, &self.supervisor)
            .with_task_id(task_id)
            .with_state(&task.state)
            .with_repo_path(&task.repo)
            .with_summary(verify_summary(envelope, &previous_state, &task.state, appended))
            .with_evidence(envelope.evidence.clone());
        self.inbox.enqueue(&self.supervisor, &verify)?;

        info!(from_state = %previous_state, to_state = %task.state, appended, "update applied");
        Ok(task.state)
    }

    fn stub_task(&self, task_id: &str, envelope: &Envelope) -> Task {
        warn!(task_id, "update for unknown task, creating stub");
        let state = envelope
            .state
            .as_deref()
            .filter(|state| {
                self.workflow
                    .as_ref()
                    .is_none_or(|workflow| workflow.contains_state(state))
            })
            .unwrap_or(ORPHAN_STATE);
        let mut task = Task::new(
            task_id,
            envelope.repo_path.clone().unwrap_or_default(),
            "",
            state,
        );
        task.owner = envelope.from.clone();
        task.workflow = self.workflow.as_ref().map(|workflow| workflow.name.clone());
        task.meta.insert("stub".to_string(), Value::Bool(true));
        task
    }

    /// Poller over the bridge's own inbox routing `fsm_update` envelopes.
    pub fn poller(&self) -> Result<Poller<'_>> {
        let handlers = Handlers::new().on(MessageType::FsmUpdate, |envelope| {
            self.apply_update(envelope).map(|_| ())
        });
        self.inbox.poller(&self.identity, handlers)
    }
}

fn verify_summary(envelope: &Envelope, from_state: &str, to_state: &str, appended: usize) -> String {
    let task_id = envelope.task_id.as_deref().unwrap_or_default();
    let mut summary = if from_state == to_state {
        format!("{} updated {task_id} in {to_state}", envelope.from)
    } else {
        format!("{} moved {task_id} {from_state} -> {to_state}", envelope.from)
    };
    if appended > 0 {
        summary.push_str(&format!(" (+{appended} evidence)"));
    }
    if let Some(note) = envelope.summary.as_deref().filter(|note| !note.trim().is_empty()) {
        summary.push_str(": ");
        summary.push_str(note.trim());
    }
    summary
}
