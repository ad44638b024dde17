//! Transition resolution for one `advance()` step.

use serde::{Deserialize, Serialize};

use crate::core::types::GuardResult;
use crate::core::workflow::StateSpec;

/// Result of advancing one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub task_id: String,
    pub from: String,
    pub to: String,
    /// AND of every guard's `ok`; `true` when the state has no guards.
    pub ok: bool,
    pub guard_results: Vec<GuardResult>,
}

impl Transition {
    pub fn moved(&self) -> bool {
        self.from != self.to
    }

    pub fn failing_guards(&self) -> impl Iterator<Item = &GuardResult> {
        self.guard_results.iter().filter(|result| !result.ok)
    }
}

/// AND over guard outcomes. Vacuously true for an empty slice.
pub fn all_guards_ok(results: &[GuardResult]) -> bool {
    results.iter().all(|result| result.ok)
}

/// Resolve the next state using only edges declared on `spec`.
///
/// - pass: `on_pass`, else `next`
/// - fail: `on_fail`
/// - no applicable edge (or unknown state): stay on `current`
pub fn resolve_next_state(spec: Option<&StateSpec>, current: &str, all_ok: bool) -> String {
    let Some(spec) = spec else {
        return current.to_string();
    };
    let target = if all_ok {
        spec.on_pass.as_ref().or(spec.next.as_ref())
    } else {
        spec.on_fail.as_ref()
    };
    target.cloned().unwrap_or_else(|| current.to_string())
}
