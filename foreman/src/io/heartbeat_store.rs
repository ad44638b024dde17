//! Heartbeat files and the watcher's classification ledger under `comms_root`.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::heartbeat::{HeartbeatRecord, HeartbeatStatus, fold_status};
use crate::core::ids::validate_id;
use crate::io::atomic::{is_hidden, write_json_atomic};

/// Paths under the comms root.
#[derive(Debug, Clone)]
pub struct CommsLayout {
    root: PathBuf,
}

impl CommsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("watch_ledger.json")
    }

    pub fn record_path(&self, agent_id: &str) -> Result<PathBuf> {
        validate_id(agent_id)?;
        Ok(self.state_dir().join(format!("{agent_id}.json")))
    }

    pub fn log_path(&self, agent_id: &str) -> Result<PathBuf> {
        validate_id(agent_id)?;
        Ok(self.logs_dir().join(format!("{agent_id}.log")))
    }
}

pub fn write_record(path: &Path, record: &HeartbeatRecord) -> Result<()> {
    write_json_atomic(path, record)
}

pub fn read_record(path: &Path) -> Result<HeartbeatRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Every record under `state/`, each parsed independently so one bad file
/// cannot hide the rest.
pub fn scan_records(layout: &CommsLayout) -> Result<Vec<(PathBuf, Result<HeartbeatRecord>)>> {
    let dir = layout.state_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        if is_hidden(&path) || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths
        .into_iter()
        .map(|path| {
            let record = read_record(&path);
            (path, record)
        })
        .collect())
}

/// Last reported status per agent, scoped to one process instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchLedger {
    #[serde(default)]
    pub agents: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub instance: String,
    pub status: HeartbeatStatus,
    pub updated_at: DateTime<Utc>,
}

/// Result of folding a fresh classification into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Status previously reported for the same instance.
    pub previous: Option<HeartbeatStatus>,
    /// Status to report now.
    pub status: HeartbeatStatus,
}

impl WatchLedger {
    /// Record `classified` for `record`'s instance and return the folded
    /// status. A new instance (different pid or start time) starts fresh.
    pub fn observe(
        &mut self,
        record: &HeartbeatRecord,
        classified: HeartbeatStatus,
        now: DateTime<Utc>,
    ) -> Observation {
        let instance = record.instance_key();
        let previous = self
            .agents
            .get(&record.agent_id)
            .filter(|entry| entry.instance == instance)
            .map(|entry| entry.status);
        let status = previous.map_or(classified, |prev| fold_status(prev, classified));
        self.agents.insert(
            record.agent_id.clone(),
            LedgerEntry {
                instance,
                status,
                updated_at: now,
            },
        );
        Observation { previous, status }
    }
}

/// Load the ledger; missing or corrupt files start empty.
pub fn load_ledger(path: &Path) -> WatchLedger {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return WatchLedger::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "ledger unreadable, starting empty");
            return WatchLedger::default();
        }
    };
    serde_json::from_str(&contents).unwrap_or_else(|err| {
        warn!(path = %path.display(), err = %err, "ledger corrupt, starting empty");
        WatchLedger::default()
    })
}

pub fn save_ledger(path: &Path, ledger: &WatchLedger) -> Result<()> {
    write_json_atomic(path, ledger)
}
