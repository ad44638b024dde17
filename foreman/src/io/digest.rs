//! End-of-batch digest: `latest.json` for machines, `latest.md` for people.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::heartbeat::HeartbeatStatus;
use crate::core::transition::Transition;
use crate::io::atomic::{write_atomic, write_json_atomic};

const DIGEST_TEMPLATE: &str = include_str!("templates/digest.md");

/// Captured output kept per failing guard.
const OUTPUT_EXCERPT_CHARS: usize = 800;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub workflow: String,
    pub processed: usize,
    pub moved: usize,
    pub failed: usize,
    pub entries: Vec<DigestEntry>,
    pub stale_agents: Vec<StaleAgent>,
}

impl Digest {
    pub fn new(workflow: &str, entries: Vec<DigestEntry>, stale_agents: Vec<StaleAgent>) -> Self {
        Self {
            generated_at: Utc::now(),
            workflow: workflow.to_string(),
            processed: entries.len(),
            moved: entries.iter().filter(|entry| entry.from != entry.to).count(),
            failed: entries.iter().filter(|entry| !entry.ok).count(),
            entries,
            stale_agents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub task_id: String,
    pub ok: bool,
    pub from: String,
    pub to: String,
    pub guard_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_guards: Vec<FailingGuard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DigestEntry {
    pub fn from_transition(transition: &Transition) -> Self {
        Self {
            task_id: transition.task_id.clone(),
            ok: transition.ok,
            from: transition.from.clone(),
            to: transition.to.clone(),
            guard_count: transition.guard_results.len(),
            failing_guards: transition
                .failing_guards()
                .map(|result| FailingGuard {
                    guard: result.guard.clone(),
                    rc: result.rc,
                    timed_out: result.timed_out,
                    output: excerpt(if result.stderr.trim().is_empty() {
                        &result.stdout
                    } else {
                        &result.stderr
                    }),
                })
                .collect(),
            error: None,
        }
    }

    /// A task that could not be advanced at all; it stays in `state`.
    pub fn failure(task_id: &str, state: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            ok: false,
            from: state.to_string(),
            to: state.to_string(),
            guard_count: 0,
            failing_guards: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingGuard {
    pub guard: String,
    pub rc: Option<i32>,
    pub timed_out: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAgent {
    pub agent_id: String,
    pub status: HeartbeatStatus,
    pub output_age_secs: u64,
    pub heartbeat_age_secs: u64,
}

/// Tail of `text`, at most [`OUTPUT_EXCERPT_CHARS`] characters.
fn excerpt(text: &str) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= OUTPUT_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - OUTPUT_EXCERPT_CHARS).collect();
    format!("...{tail}")
}

pub fn render_markdown(digest: &Digest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("digest.md", DIGEST_TEMPLATE)?;
    Ok(env.get_template("digest.md")?.render(digest)?)
}

/// Write both digest files atomically. Returns `(json, markdown)` paths.
pub fn write_digest(dir: &Path, digest: &Digest) -> Result<(PathBuf, PathBuf)> {
    let json_path = dir.join("latest.json");
    let md_path = dir.join("latest.md");
    write_json_atomic(&json_path, digest)?;
    write_atomic(&md_path, render_markdown(digest)?.as_bytes())?;
    info!(
        processed = digest.processed,
        failed = digest.failed,
        path = %json_path.display(),
        "digest written"
    );
    Ok((json_path, md_path))
}
