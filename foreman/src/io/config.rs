//! Process-wide configuration, stored as `.foreman/config.toml`.
//!
//! Built once at startup (defaults < file < `FOREMAN_*` environment < CLI
//! flags) and passed by reference into every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::heartbeat::Thresholds;
use crate::core::ids::validate_id;
use crate::error::FleetError;
use crate::io::atomic::write_atomic;

pub const DEFAULT_CONFIG_PATH: &str = ".foreman/config.toml";
const DEFAULT_BASE: &str = ".foreman";

/// Foreman configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take defaults; relative
/// paths resolve against the process working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    /// One JSON record per task.
    pub tasks_root: PathBuf,
    /// `<inbox_root>/<agent>/inbox/` per worker identity.
    pub inbox_root: PathBuf,
    /// Heartbeat records, wrapper logs and the escalation event log.
    pub comms_root: PathBuf,
    /// Isolated working copies, one per task id.
    pub workspaces_root: PathBuf,
    /// Guard result artifacts (`<task>/<state>/<guard>.json`).
    pub evidence_root: PathBuf,
    /// End-of-batch digests.
    pub digest_dir: PathBuf,
    /// Workflow files looked up by name (`<name>.yaml|.yml|.json`).
    pub workflows_dir: PathBuf,

    /// Identity that receives `verify` envelopes and escalations.
    pub supervisor: String,
    /// Identity the bridge sends from and polls for `fsm_update` envelopes.
    pub bridge_identity: String,

    /// Output silence (seconds) before a live worker counts as stalled.
    pub idle_secs: u64,
    /// CPU percent below which a silent worker counts as stalled.
    pub cpu_threshold: f64,

    /// Truncate captured guard stdout/stderr beyond this many bytes each.
    pub guard_output_limit_bytes: usize,
    /// Default per-guard timeout when the workflow does not set one.
    pub guard_timeout_secs: u64,

    /// TTL stamped on outgoing envelopes that carry none (0 = no TTL).
    pub message_ttl_secs: u64,
    /// Sleep between scans for polling loops.
    pub poll_interval_secs: u64,
    /// Wrapper tick interval.
    pub heartbeat_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self::rooted(Path::new(DEFAULT_BASE))
    }
}

impl FleetConfig {
    /// Default configuration with every path under `base`.
    pub fn rooted(base: &Path) -> Self {
        Self {
            tasks_root: base.join("tasks"),
            inbox_root: base.join("agents"),
            comms_root: base.join("comms"),
            workspaces_root: base.join("workspaces"),
            evidence_root: base.join("evidence"),
            digest_dir: base.join("digests"),
            workflows_dir: base.join("workflows"),
            supervisor: "supervisor".to_string(),
            bridge_identity: "bridge".to_string(),
            idle_secs: 300,
            cpu_threshold: 5.0,
            guard_output_limit_bytes: 16_000,
            guard_timeout_secs: 30 * 60,
            message_ttl_secs: 60 * 60,
            poll_interval_secs: 5,
            heartbeat_secs: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_secs == 0 {
            return Err(anyhow!("idle_secs must be > 0"));
        }
        if !self.cpu_threshold.is_finite() || self.cpu_threshold < 0.0 {
            return Err(anyhow!("cpu_threshold must be a non-negative number"));
        }
        if self.guard_output_limit_bytes == 0 {
            return Err(anyhow!("guard_output_limit_bytes must be > 0"));
        }
        if self.guard_timeout_secs == 0 {
            return Err(anyhow!("guard_timeout_secs must be > 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.heartbeat_secs == 0 {
            return Err(anyhow!("heartbeat_secs must be > 0"));
        }
        validate_id(&self.supervisor).context("supervisor")?;
        validate_id(&self.bridge_identity).context("bridge_identity")?;
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            idle_secs: self.idle_secs,
            cpu_threshold: self.cpu_threshold,
        }
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_secs(self.guard_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn default_ttl(&self) -> Option<u64> {
        (self.message_ttl_secs > 0).then_some(self.message_ttl_secs)
    }

    /// Apply `FOREMAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(v) = path("FOREMAN_TASKS_ROOT") {
            self.tasks_root = v;
        }
        if let Some(v) = path("FOREMAN_INBOX_ROOT") {
            self.inbox_root = v;
        }
        if let Some(v) = path("FOREMAN_COMMS_ROOT") {
            self.comms_root = v;
        }
        if let Some(v) = path("FOREMAN_WORKSPACES_ROOT") {
            self.workspaces_root = v;
        }
        if let Some(v) = path("FOREMAN_EVIDENCE_ROOT") {
            self.evidence_root = v;
        }
        if let Some(v) = path("FOREMAN_DIGEST_DIR") {
            self.digest_dir = v;
        }
        if let Some(v) = lookup("FOREMAN_SUPERVISOR").filter(|v| !v.is_empty()) {
            self.supervisor = v;
        }
        if let Some(v) = parse_env(&lookup, "FOREMAN_IDLE_SECS")? {
            self.idle_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "FOREMAN_CPU_THRESHOLD")? {
            self.cpu_threshold = v;
        }
        if let Some(v) = parse_env(&lookup, "FOREMAN_GUARD_OUTPUT_LIMIT")? {
            self.guard_output_limit_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "FOREMAN_MESSAGE_TTL_SECS")? {
            self.message_ttl_secs = v;
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("{key}={raw}: {err}")),
    }
}

/// Load config from a TOML file, then apply the environment.
///
/// A missing file yields defaults. Any parse or validation failure is a
/// [`FleetError::Config`].
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env()
        .map_err(|err| FleetError::config(format!("environment: {err:#}")))?;
    cfg.validate()
        .map_err(|err| FleetError::config(format!("{}: {err:#}", path.display())))?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<FleetConfig> {
    if !path.exists() {
        return Ok(FleetConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents)
        .map_err(|err| FleetError::config(format!("parse {}: {err}", path.display())).into())
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FleetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
