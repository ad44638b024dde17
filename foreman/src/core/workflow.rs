//! Declarative workflow: states, their guards, and the edges between them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ids::validate_id;

pub const DEFAULT_INITIAL_STATE: &str = "queued";

fn default_initial() -> String {
    DEFAULT_INITIAL_STATE.to_string()
}

/// Edges and guards for one state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSpec {
    pub guards: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Guard declaration: a bare command template or a command with a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardSpec {
    Command(String),
    Detailed {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl GuardSpec {
    pub fn command(&self) -> &str {
        match self {
            Self::Command(cmd) | Self::Detailed { cmd, .. } => cmd,
        }
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        match self {
            Self::Command(_) => None,
            Self::Detailed { timeout_secs, .. } => *timeout_secs,
        }
    }
}

/// A named validation command bound to a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub name: String,
    /// Command template (before rendering) or concrete shell command (after).
    pub command: String,
    pub timeout: Duration,
}

/// Immutable workflow spec, loaded once per batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    /// State that newly queued tasks sit in until assigned.
    #[serde(default = "default_initial")]
    pub initial: String,
    pub states: BTreeMap<String, StateSpec>,
    #[serde(default)]
    pub guards: BTreeMap<String, GuardSpec>,
}

impl Workflow {
    pub fn contains_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    pub fn state(&self, state: &str) -> Option<&StateSpec> {
        self.states.get(state)
    }

    /// Guards bound to `state`, in declaration order.
    ///
    /// Unknown states and undeclared guard names yield nothing; a validated
    /// workflow has neither.
    pub fn guards_for(&self, state: &str, default_timeout: Duration) -> Vec<Guard> {
        let Some(spec) = self.states.get(state) else {
            return Vec::new();
        };
        spec.guards
            .iter()
            .filter_map(|name| {
                self.guards.get(name).map(|guard| Guard {
                    name: name.clone(),
                    command: guard.command().to_string(),
                    timeout: guard
                        .timeout_secs()
                        .map(Duration::from_secs)
                        .unwrap_or(default_timeout),
                })
            })
            .collect()
    }

    /// States with at least one guard; the batch driver only processes these.
    pub fn actionable_states(&self) -> BTreeSet<String> {
        self.states
            .iter()
            .filter(|(_, spec)| !spec.guards.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Check references a schema cannot express:
/// - `initial` is a declared state
/// - every guard a state lists is declared
/// - every `on_pass`/`on_fail`/`next` target is a declared state
/// - guard names are usable as path components
/// - guard commands are non-empty
pub fn validate_workflow(workflow: &Workflow) -> Vec<String> {
    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push("workflow name must not be empty".to_string());
    }
    if workflow.states.is_empty() {
        errors.push("workflow declares no states".to_string());
    }
    if !workflow.states.is_empty() && !workflow.contains_state(&workflow.initial) {
        errors.push(format!(
            "initial state '{}' is not declared",
            workflow.initial
        ));
    }

    for (name, spec) in &workflow.states {
        for guard in &spec.guards {
            if !workflow.guards.contains_key(guard) {
                errors.push(format!("state '{name}': undeclared guard '{guard}'"));
            }
        }
        for (edge, target) in [
            ("on_pass", &spec.on_pass),
            ("on_fail", &spec.on_fail),
            ("next", &spec.next),
        ] {
            if let Some(target) = target
                && !workflow.contains_state(target)
            {
                errors.push(format!(
                    "state '{name}': {edge} targets undeclared state '{target}'"
                ));
            }
        }
    }

    for (name, guard) in &workflow.guards {
        if let Err(err) = validate_id(name) {
            errors.push(format!("guard '{name}': {err}"));
        }
        if guard.command().trim().is_empty() {
            errors.push(format!("guard '{name}': command must not be empty"));
        }
    }

    errors
}
