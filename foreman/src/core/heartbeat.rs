//! Heartbeat records, stall/death classification and escalation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Starting,
    Running,
    Stalled,
    Dead,
    Exited,
    Terminated,
}

impl HeartbeatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Dead => "dead",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Terminated)
    }

    /// Degradation rank; status may only move to an equal or higher rank.
    fn rank(self) -> u8 {
        match self {
            Self::Starting | Self::Running => 0,
            Self::Stalled => 1,
            Self::Dead => 2,
            Self::Exited | Self::Terminated => 3,
        }
    }
}

/// Per-process liveness file, overwritten in place on every wrapper tick.
///
/// The wrapper is the only writer, so `status` here is what the wrapper
/// knows: `starting`, `running`, `exited` or `terminated`. The watcher never
/// rewrites this file. Its `stalled`/`dead` verdicts, degraded monotonically
/// per process instance, live in `comms_root/watch_ledger.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub agent_id: String,
    pub pid: u32,
    pub cmd: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_output_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Wrapper-side status only; see the type docs for `stalled`/`dead`.
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default)]
    pub bytes_err: u64,
}

impl HeartbeatRecord {
    pub fn starting(agent_id: &str, pid: u32, cmd: &str, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            pid,
            cmd: cmd.to_string(),
            started_at: now,
            last_output_at: None,
            last_heartbeat_at: now,
            exit_code: None,
            status: HeartbeatStatus::Starting,
            cpu_percent: 0.0,
            bytes_out: 0,
            bytes_err: 0,
        }
    }

    /// Seconds since the process last wrote output (or started, if silent).
    pub fn output_age_secs(&self, now: DateTime<Utc>) -> f64 {
        age_secs(self.last_output_at.unwrap_or(self.started_at), now)
    }

    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> f64 {
        age_secs(self.last_heartbeat_at, now)
    }

    /// Identity of the process instance this record describes.
    pub fn instance_key(&self) -> String {
        format!("{}@{}", self.pid, self.started_at.timestamp_millis())
    }
}

fn age_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - since).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Watcher thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Output silence (seconds) before a live process counts as stalled.
    pub idle_secs: u64,
    /// CPU percent below which a silent process counts as stalled.
    pub cpu_threshold: f64,
}

/// Classify one record.
///
/// - `exited` if `exit_code` is present, regardless of other fields
/// - `terminated` if the wrapper recorded an external shutdown
/// - `dead` if the pid is gone and the heartbeat is older than `2 × idle_secs`
/// - `stalled` if the pid is alive, output is older than `idle_secs` and CPU
///   is below the floor
/// - otherwise `running`
pub fn classify(
    record: &HeartbeatRecord,
    pid_alive: bool,
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> HeartbeatStatus {
    if record.exit_code.is_some() {
        return HeartbeatStatus::Exited;
    }
    if record.status == HeartbeatStatus::Terminated {
        return HeartbeatStatus::Terminated;
    }
    let idle = thresholds.idle_secs as f64;
    if !pid_alive && record.heartbeat_age_secs(now) > 2.0 * idle {
        return HeartbeatStatus::Dead;
    }
    if pid_alive
        && record.output_age_secs(now) > idle
        && record.cpu_percent < thresholds.cpu_threshold
    {
        return HeartbeatStatus::Stalled;
    }
    HeartbeatStatus::Running
}

/// Combine a previous status with a fresh classification of the same process
/// instance. Status only degrades; terminal statuses stick.
pub fn fold_status(previous: HeartbeatStatus, classified: HeartbeatStatus) -> HeartbeatStatus {
    if previous.is_terminal() {
        return previous;
    }
    if classified.rank() >= previous.rank() {
        classified
    } else {
        previous
    }
}

/// Kind of escalation raised by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    TerminalStalled,
    TerminalDead,
    TerminalExit,
}

impl EscalationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerminalStalled => "terminal_stalled",
            Self::TerminalDead => "terminal_dead",
            Self::TerminalExit => "terminal_exit",
        }
    }
}

/// Escalation to raise when `previous → current` is observed, if any.
///
/// Entering `stalled` or `dead` escalates; so does a non-zero exit, once.
pub fn escalation_for(
    previous: Option<HeartbeatStatus>,
    current: HeartbeatStatus,
    exit_code: Option<i32>,
) -> Option<EscalationKind> {
    if previous == Some(current) {
        return None;
    }
    match current {
        HeartbeatStatus::Stalled => Some(EscalationKind::TerminalStalled),
        HeartbeatStatus::Dead => Some(EscalationKind::TerminalDead),
        HeartbeatStatus::Exited if exit_code.is_some_and(|code| code != 0) => {
            Some(EscalationKind::TerminalExit)
        }
        _ => None,
    }
}

/// Event appended to the shared log and written as a discrete file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub ts: DateTime<Utc>,
    pub agent_id: String,
    pub kind: EscalationKind,
    pub status: HeartbeatStatus,
    pub pid: u32,
    pub cmd: String,
    pub output_age_secs: f64,
    pub heartbeat_age_secs: f64,
    pub cpu_percent: f64,
    pub exit_code: Option<i32>,
    /// Path of the heartbeat record that triggered the escalation.
    pub record_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const THRESHOLDS: Thresholds = Thresholds {
        idle_secs: 60,
        cpu_threshold: 5.0,
    };

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().expect("ts")
    }

    fn record(output_age: i64, heartbeat_age: i64, cpu: f64) -> HeartbeatRecord {
        let now = now();
        let mut record = HeartbeatRecord::starting("a1", 4242, "run", now - TimeDelta::hours(1));
        record.status = HeartbeatStatus::Running;
        record.last_output_at = Some(now - TimeDelta::seconds(output_age));
        record.last_heartbeat_at = now - TimeDelta::seconds(heartbeat_age);
        record.cpu_percent = cpu;
        record
    }

    #[test]
    fn exit_code_wins_over_everything() {
        let mut rec = record(10_000, 10_000, 0.0);
        rec.exit_code = Some(0);
        assert_eq!(
            classify(&rec, false, now(), &THRESHOLDS),
            HeartbeatStatus::Exited
        );
    }

    #[test]
    fn dead_requires_missing_pid_and_double_idle_heartbeat_age() {
        let rec = record(500, 121, 0.0);
        assert_eq!(
            classify(&rec, false, now(), &THRESHOLDS),
            HeartbeatStatus::Dead
        );
        let recent = record(500, 119, 0.0);
        assert_eq!(
            classify(&recent, false, now(), &THRESHOLDS),
            HeartbeatStatus::Running
        );
    }

    #[test]
    fn stalled_requires_live_pid_silence_and_low_cpu() {
        let rec = record(61, 1, 1.0);
        assert_eq!(
            classify(&rec, true, now(), &THRESHOLDS),
            HeartbeatStatus::Stalled
        );
        let busy = record(61, 1, 50.0);
        assert_eq!(
            classify(&busy, true, now(), &THRESHOLDS),
            HeartbeatStatus::Running
        );
        let chatty = record(5, 1, 0.0);
        assert_eq!(
            classify(&chatty, true, now(), &THRESHOLDS),
            HeartbeatStatus::Running
        );
    }

    #[test]
    fn silent_process_ages_from_start() {
        let mut rec = record(0, 1, 0.0);
        rec.last_output_at = None;
        assert_eq!(
            classify(&rec, true, now(), &THRESHOLDS),
            HeartbeatStatus::Stalled
        );
    }

    #[test]
    fn fold_never_recovers_within_instance() {
        use HeartbeatStatus::{Dead, Exited, Running, Stalled};
        assert_eq!(fold_status(Running, Stalled), Stalled);
        assert_eq!(fold_status(Stalled, Running), Stalled);
        assert_eq!(fold_status(Stalled, Dead), Dead);
        assert_eq!(fold_status(Dead, Stalled), Dead);
        assert_eq!(fold_status(Exited, Dead), Exited);
        assert_eq!(fold_status(Dead, Exited), Exited);
    }

    #[test]
    fn escalates_only_on_entry() {
        use HeartbeatStatus::{Dead, Exited, Running, Stalled};
        assert_eq!(
            escalation_for(Some(Running), Stalled, None),
            Some(EscalationKind::TerminalStalled)
        );
        assert_eq!(escalation_for(Some(Stalled), Stalled, None), None);
        assert_eq!(
            escalation_for(None, Dead, None),
            Some(EscalationKind::TerminalDead)
        );
        assert_eq!(escalation_for(Some(Running), Exited, Some(0)), None);
        assert_eq!(
            escalation_for(Some(Running), Exited, Some(2)),
            Some(EscalationKind::TerminalExit)
        );
    }
}
