//! Guard result artifacts, one file per run under `<task_id>/<state>/<guard>/`.
//!
//! Task evidence points at these files, so an artifact is never rewritten
//! once its path has been handed out.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::core::types::GuardResult;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone)]
pub struct EvidenceWriter {
    root: PathBuf,
}

impl EvidenceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every run of `guard` for `task_id` in `state`.
    pub fn guard_dir(&self, task_id: &str, state: &str, guard: &str) -> PathBuf {
        self.root
            .join(task_id)
            .join(sanitize_segment(state))
            .join(sanitize_segment(guard))
    }

    /// Persist one guard run as a new artifact named after its start time.
    pub fn persist(&self, task_id: &str, state: &str, result: &GuardResult) -> Result<PathBuf> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let name = format!("{}-{suffix}.json", result.started.format("%Y%m%dT%H%M%S%9fZ"));
        let path = self.guard_dir(task_id, state, &result.guard).join(name);
        write_json_atomic(&path, result)?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// State names are free-form; keep them to one safe path segment.
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "_".to_string(),
        rest => rest.to_string(),
    }
}
