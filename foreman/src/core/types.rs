//! Task and evidence records plus the structured guard result.
//!
//! These are the on-disk contracts of the task store. Field names are stable
//! JSON keys; additive fields must default on read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Missing timestamps read as the epoch, so the same bytes always decode to
/// the same record.
fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// What an evidence entry documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    TestOutput,
    Log,
    ArtifactLink,
    GuardResult,
}

/// Append-only record attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// Inline content or a path/URL, depending on `kind`.
    #[serde(alias = "path")]
    pub content: String,
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
}

impl Evidence {
    pub fn new(kind: EvidenceKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One unit of work tracked through the states of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    pub state: String,
    /// Worker identity currently driving the task; empty when unowned.
    #[serde(default)]
    pub owner: String,
    /// Workflow the task belongs to, if it is bound to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        let created = Utc::now();
        Self {
            task_id: task_id.into(),
            repo: repo.into(),
            branch: branch.into(),
            state: state.into(),
            owner: String::new(),
            workflow: None,
            evidence: Vec::new(),
            meta: BTreeMap::new(),
            created_at: created,
            updated_at: created,
        }
    }

    pub fn is_unowned(&self) -> bool {
        self.owner.trim().is_empty()
    }

    /// Human intent for the work, from `meta.intent`, falling back to the id.
    pub fn intent(&self) -> String {
        self.meta
            .get("intent")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.task_id.clone())
    }

    /// Append evidence unless an identical entry is already recorded.
    ///
    /// Returns `true` if the sequence grew. Existing entries are never touched.
    pub fn append_evidence(&mut self, evidence: Evidence) -> bool {
        if self.evidence.contains(&evidence) {
            return false;
        }
        self.evidence.push(evidence);
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Structured outcome of running one guard command.
///
/// A failing guard is data (`ok == false`), never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    pub guard: String,
    pub cmd: String,
    pub ok: bool,
    /// Exit code; `None` when the process was killed or never started.
    pub rc: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    #[serde(default)]
    pub timed_out: bool,
    /// Killed because shutdown was requested. Interrupted results are never
    /// persisted as evidence.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl GuardResult {
    /// Result for a guard that could not be started at all.
    pub fn not_started(guard: &str, cmd: &str, reason: &str) -> Self {
        let at = Utc::now();
        Self {
            guard: guard.to_string(),
            cmd: cmd.to_string(),
            ok: false,
            rc: None,
            stdout: String::new(),
            stderr: reason.to_string(),
            started: at,
            ended: at,
            timed_out: false,
            interrupted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_evidence_skips_exact_duplicates() {
        let mut task = Task::new("t1", "/repo", "main", "Build");
        let entry = Evidence::new(EvidenceKind::Log, "first");
        assert!(task.append_evidence(entry.clone()));
        assert!(!task.append_evidence(entry));
        assert!(task.append_evidence(Evidence::new(EvidenceKind::Log, "second")));
        assert_eq!(task.evidence.len(), 2);
        assert_eq!(task.evidence[0].content, "first");
    }

    #[test]
    fn missing_timestamps_decode_deterministically() {
        let raw = r#"{"kind":"log","content":"ran tests"}"#;
        let first: Evidence = serde_json::from_str(raw).expect("parse");
        let second: Evidence = serde_json::from_str(raw).expect("parse");
        assert_eq!(first, second);
        assert_eq!(first.timestamp, DateTime::UNIX_EPOCH);

        let mut task = Task::new("t1", "/repo", "main", "Build");
        assert!(task.append_evidence(first));
        assert!(!task.append_evidence(second));

        let task: Task =
            serde_json::from_str(r#"{"task_id":"t1","repo":"/repo","state":"queued"}"#).expect("parse");
        assert_eq!(task.created_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn intent_falls_back_to_task_id() {
        let mut task = Task::new("t1", "/repo", "main", "queued");
        assert_eq!(task.intent(), "t1");
        task.meta
            .insert("intent".to_string(), Value::from("fix the build"));
        assert_eq!(task.intent(), "fix the build");
    }

    #[test]
    fn task_reads_minimal_document() {
        let raw = r#"{"task_id":"t9","repo":"/r","state":"queued"}"#;
        let task: Task = serde_json::from_str(raw).expect("parse");
        assert!(task.is_unowned());
        assert!(task.evidence.is_empty());
        assert_eq!(task.branch, "");
    }

    #[test]
    fn evidence_accepts_path_alias_and_kebab_kind() {
        let raw = r#"{"kind":"artifact-link","path":"s3://bucket/log.txt"}"#;
        let evidence: Evidence = serde_json::from_str(raw).expect("parse");
        assert_eq!(evidence.kind, EvidenceKind::ArtifactLink);
        assert_eq!(evidence.content, "s3://bucket/log.txt");
    }
}
