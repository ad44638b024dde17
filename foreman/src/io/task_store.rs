//! Task records on top of a [`KvStore`].
//!
//! One record per `task_id`, persisted atomically. Listing re-scans storage
//! on every call and reads records lazily.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::ids::validate_id;
use crate::core::types::Task;
use crate::error::FleetError;
use crate::io::kv::KvStore;

/// Which owners a listing should match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OwnerFilter {
    #[default]
    Any,
    Unowned,
    Is(String),
}

/// Predicate applied while listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match only tasks in one of these states (`None` = any state).
    pub states: Option<BTreeSet<String>>,
    pub owner: OwnerFilter,
    /// Match tasks bound to this workflow, or not bound to any.
    pub workflow: Option<String>,
}

impl TaskFilter {
    pub fn in_states<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: Some(states.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(states) = &self.states
            && !states.contains(&task.state)
        {
            return false;
        }
        let owner_ok = match &self.owner {
            OwnerFilter::Any => true,
            OwnerFilter::Unowned => task.is_unowned(),
            OwnerFilter::Is(owner) => &task.owner == owner,
        };
        if !owner_ok {
            return false;
        }
        match (&self.workflow, &task.workflow) {
            (Some(wanted), Some(bound)) => wanted == bound,
            _ => true,
        }
    }
}

/// Persistent task records.
#[derive(Debug, Clone)]
pub struct TaskStore<S> {
    store: S,
}

impl<S: KvStore> TaskStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &S {
        &self.store
    }

    /// Load one task. Fails with [`FleetError::NotFound`] for unknown ids.
    pub fn read_task(&self, task_id: &str) -> Result<Task> {
        self.find_task(task_id)?
            .ok_or_else(|| FleetError::NotFound(task_id.to_string()).into())
    }

    /// Load one task, returning `None` for unknown ids.
    pub fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let Some(bytes) = self.store.get(task_id)? else {
            return Ok(None);
        };
        let task: Task =
            serde_json::from_slice(&bytes).with_context(|| format!("parse task {task_id}"))?;
        Ok(Some(task))
    }

    /// Atomically persist `task` under its id.
    #[instrument(skip_all, fields(task_id = %task.task_id, state = %task.state))]
    pub fn write_task(&self, task: &Task) -> Result<()> {
        validate_id(&task.task_id).context("task_id")?;
        let mut buf = serde_json::to_string_pretty(task).context("serialize task")?;
        buf.push('\n');
        self.store.put(&task.task_id, buf.as_bytes())?;
        debug!("task written");
        Ok(())
    }

    /// Lazily iterate tasks matching `filter`.
    ///
    /// Keys are scanned now; each record is read when the iterator reaches
    /// it. Records deleted in between are skipped; unreadable ones surface
    /// as `Err` items so one bad file never hides the rest.
    pub fn list_tasks(&self, filter: TaskFilter) -> Result<TaskIter<'_, S>> {
        let keys = self.store.list()?;
        Ok(TaskIter {
            store: self,
            keys: keys.into_iter(),
            filter,
        })
    }
}

/// Iterator returned by [`TaskStore::list_tasks`].
pub struct TaskIter<'a, S> {
    store: &'a TaskStore<S>,
    keys: std::vec::IntoIter<String>,
    filter: TaskFilter,
}

impl<S: KvStore> Iterator for TaskIter<'_, S> {
    type Item = Result<Task>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.store.find_task(&key) {
                Ok(Some(task)) if self.filter.matches(&task) => return Some(Ok(task)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}
