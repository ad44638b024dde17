//! Escalation output: one shared JSONL log plus one file per event.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::heartbeat::EscalationEvent;
use crate::io::atomic::{random_suffix, write_json_atomic};

#[derive(Debug, Clone)]
pub struct EscalationSink {
    events_path: PathBuf,
    escalations_dir: PathBuf,
}

impl EscalationSink {
    pub fn new(events_path: impl Into<PathBuf>, escalations_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
            escalations_dir: escalations_dir.into(),
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append to the event log, then write the discrete file. Returns the
    /// discrete file's path.
    #[instrument(skip_all, fields(agent_id = %event.agent_id, kind = event.kind.as_str()))]
    pub fn raise(&self, event: &EscalationEvent) -> Result<PathBuf> {
        self.append_event(event)?;
        let name = format!(
            "{}-{}-{}-{}.json",
            event.ts.format("%Y%m%dT%H%M%S%9fZ"),
            event.agent_id,
            event.kind.as_str(),
            random_suffix(4)
        );
        let path = self.escalations_dir.join(name);
        write_json_atomic(&path, event)?;
        info!(path = %path.display(), "escalation raised");
        Ok(path)
    }

    fn append_event(&self, event: &EscalationEvent) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize escalation")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("open {}", self.events_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.events_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heartbeat::{EscalationKind, HeartbeatStatus};
    use chrono::Utc;

    fn event(kind: EscalationKind) -> EscalationEvent {
        EscalationEvent {
            ts: Utc::now(),
            agent_id: "a1".to_string(),
            kind,
            status: HeartbeatStatus::Stalled,
            pid: 42,
            cmd: "run".to_string(),
            output_age_secs: 400.0,
            heartbeat_age_secs: 3.0,
            cpu_percent: 0.0,
            exit_code: None,
            record_path: "/comms/state/a1.json".to_string(),
        }
    }

    #[test]
    fn appends_log_lines_and_writes_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = EscalationSink::new(
            temp.path().join("events.jsonl"),
            temp.path().join("supervisor").join("escalations"),
        );
        let first = sink.raise(&event(EscalationKind::TerminalStalled)).expect("raise");
        sink.raise(&event(EscalationKind::TerminalDead)).expect("raise");

        let log = fs::read_to_string(sink.events_path()).expect("log");
        let kinds: Vec<EscalationKind> = log
            .lines()
            .map(|line| serde_json::from_str::<EscalationEvent>(line).expect("line").kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EscalationKind::TerminalStalled, EscalationKind::TerminalDead]
        );
        assert!(first.exists());
        assert_eq!(
            fs::read_dir(first.parent().expect("parent")).expect("dir").count(),
            2
        );
    }
}
