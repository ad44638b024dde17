//! Watcher role: classify every heartbeat record and escalate degradations.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::heartbeat::{
    EscalationEvent, EscalationKind, HeartbeatRecord, HeartbeatStatus, Thresholds, classify,
    escalation_for,
};
use crate::io::digest::StaleAgent;
use crate::io::escalation::EscalationSink;
use crate::io::heartbeat_store::{
    CommsLayout, WatchLedger, load_ledger, save_ledger, scan_records,
};
use crate::io::procfs::ProcessProbe;
use crate::schedule::Pass;

/// Classification of one agent in one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentFinding {
    pub agent_id: String,
    pub status: HeartbeatStatus,
    pub previous: Option<HeartbeatStatus>,
    pub escalation: Option<EscalationKind>,
    pub output_age_secs: f64,
    pub heartbeat_age_secs: f64,
}

impl AgentFinding {
    pub fn is_stale(&self) -> bool {
        matches!(self.status, HeartbeatStatus::Stalled | HeartbeatStatus::Dead)
    }

    fn to_stale_agent(&self) -> StaleAgent {
        StaleAgent {
            agent_id: self.agent_id.clone(),
            status: self.status,
            output_age_secs: self.output_age_secs as u64,
            heartbeat_age_secs: self.heartbeat_age_secs as u64,
        }
    }
}

#[derive(Debug, Default)]
pub struct WatchReport {
    pub findings: Vec<AgentFinding>,
    /// Records that could not be read or parsed.
    pub skipped: usize,
    pub escalation_files: Vec<PathBuf>,
}

pub struct Watcher<P> {
    layout: CommsLayout,
    sink: EscalationSink,
    probe: P,
    thresholds: Thresholds,
}

impl<P: ProcessProbe> Watcher<P> {
    pub fn new(layout: CommsLayout, sink: EscalationSink, probe: P, thresholds: Thresholds) -> Self {
        Self {
            layout,
            sink,
            probe,
            thresholds,
        }
    }

    /// One scan: classify, fold into the ledger, escalate, save the ledger.
    #[instrument(skip_all)]
    pub fn scan(&mut self, now: DateTime<Utc>) -> Result<WatchReport> {
        let ledger_path = self.layout.ledger_path();
        let mut ledger = load_ledger(&ledger_path);
        let mut report = WatchReport::default();

        for (path, record) in scan_records(&self.layout)? {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable heartbeat");
                    report.skipped += 1;
                    continue;
                }
            };
            let saved = ledger.agents.get(&record.agent_id).cloned();
            let mut finding = observe(&mut ledger, &record, &self.probe, &self.thresholds, now);
            finding.escalation =
                escalation_for(finding.previous, finding.status, record.exit_code);

            if let Some(kind) = finding.escalation {
                let event = EscalationEvent {
                    ts: now,
                    agent_id: record.agent_id.clone(),
                    kind,
                    status: finding.status,
                    pid: record.pid,
                    cmd: record.cmd.clone(),
                    output_age_secs: finding.output_age_secs,
                    heartbeat_age_secs: finding.heartbeat_age_secs,
                    cpu_percent: record.cpu_percent,
                    exit_code: record.exit_code,
                    record_path: path.display().to_string(),
                };
                match self.sink.raise(&event) {
                    Ok(file) => report.escalation_files.push(file),
                    Err(err) => {
                        warn!(agent_id = %record.agent_id, err = %format!("{err:#}"), "escalation failed, will retry");
                        match saved {
                            Some(entry) => ledger.agents.insert(record.agent_id.clone(), entry),
                            None => ledger.agents.remove(&record.agent_id),
                        };
                    }
                }
            } else {
                debug!(agent_id = %record.agent_id, status = finding.status.as_str(), "classified");
            }
            report.findings.push(finding);
        }

        save_ledger(&ledger_path, &ledger)?;
        let stale = report.findings.iter().filter(|finding| finding.is_stale()).count();
        info!(
            agents = report.findings.len(),
            stale,
            skipped = report.skipped,
            escalations = report.escalation_files.len(),
            "watch scan complete"
        );
        Ok(report)
    }
}

impl<P: ProcessProbe> Pass for Watcher<P> {
    fn name(&self) -> &'static str {
        "watch"
    }

    fn run_once(&mut self) -> Result<()> {
        self.scan(Utc::now())?;
        Ok(())
    }
}

fn observe(
    ledger: &mut WatchLedger,
    record: &HeartbeatRecord,
    probe: &impl ProcessProbe,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> AgentFinding {
    let classified = classify(record, probe.is_alive(record.pid), now, thresholds);
    let observation = ledger.observe(record, classified, now);
    AgentFinding {
        agent_id: record.agent_id.clone(),
        status: observation.status,
        previous: observation.previous,
        escalation: None,
        output_age_secs: record.output_age_secs(now),
        heartbeat_age_secs: record.heartbeat_age_secs(now),
    }
}

/// Stalled or dead agents, without touching the ledger or raising anything.
pub fn scan_stale(
    layout: &CommsLayout,
    probe: &impl ProcessProbe,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> Result<Vec<StaleAgent>> {
    let mut ledger = load_ledger(&layout.ledger_path());
    let mut stale = Vec::new();
    for (path, record) in scan_records(layout)? {
        match record {
            Ok(record) => {
                let finding = observe(&mut ledger, &record, probe, thresholds, now);
                if finding.is_stale() {
                    stale.push(finding.to_stale_agent());
                }
            }
            Err(err) => debug!(path = %path.display(), err = %format!("{err:#}"), "unreadable heartbeat"),
        }
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::heartbeat_store::write_record;
    use crate::test_support::FakeProbe;
    use chrono::TimeDelta;

    const THRESHOLDS: Thresholds = Thresholds {
        idle_secs: 60,
        cpu_threshold: 5.0,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        layout: CommsLayout,
        escalations: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let layout = CommsLayout::new(temp.path().join("comms"));
            let escalations = temp.path().join("supervisor").join("escalations");
            Self {
                _temp: temp,
                layout,
                escalations,
            }
        }

        fn watcher(&self, probe: FakeProbe) -> Watcher<FakeProbe> {
            Watcher::new(
                self.layout.clone(),
                EscalationSink::new(self.layout.events_path(), &self.escalations),
                probe,
                THRESHOLDS,
            )
        }

        fn write(&self, record: &HeartbeatRecord) {
            write_record(
                &self.layout.record_path(&record.agent_id).expect("path"),
                record,
            )
            .expect("write record");
        }
    }

    fn silent_record(agent: &str, pid: u32, now: DateTime<Utc>) -> HeartbeatRecord {
        let mut record = HeartbeatRecord::starting(agent, pid, "run", now - TimeDelta::hours(1));
        record.status = HeartbeatStatus::Running;
        record.last_output_at = Some(now - TimeDelta::seconds(600));
        record.last_heartbeat_at = now - TimeDelta::seconds(5);
        record
    }

    #[test]
    fn stall_escalates_once() {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.write(&silent_record("a1", 100, now));
        let mut watcher = fx.watcher(FakeProbe::alive([100]));

        let first = watcher.scan(now).expect("scan");
        assert_eq!(first.findings[0].status, HeartbeatStatus::Stalled);
        assert_eq!(first.findings[0].escalation, Some(EscalationKind::TerminalStalled));
        assert_eq!(first.escalation_files.len(), 1);

        let second = watcher.scan(now).expect("scan");
        assert_eq!(second.findings[0].escalation, None);
        let log = std::fs::read_to_string(fx.layout.events_path()).expect("events");
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn status_does_not_recover_within_instance() {
        let fx = Fixture::new();
        let now = Utc::now();
        let mut record = silent_record("a1", 100, now);
        fx.write(&record);
        let mut watcher = fx.watcher(FakeProbe::alive([100]));
        watcher.scan(now).expect("scan");

        record.last_output_at = Some(now);
        fx.write(&record);
        let report = watcher.scan(now).expect("scan");
        assert_eq!(report.findings[0].status, HeartbeatStatus::Stalled);
    }

    #[test]
    fn degraded_status_lives_in_the_ledger_not_the_record() {
        let fx = Fixture::new();
        let now = Utc::now();
        let record = silent_record("a1", 100, now);
        fx.write(&record);
        let record_path = fx.layout.record_path("a1").expect("path");
        let before = std::fs::read_to_string(&record_path).expect("read record");

        fx.watcher(FakeProbe::alive([100])).scan(now).expect("scan");

        assert_eq!(std::fs::read_to_string(&record_path).expect("reread"), before);
        let ledger = load_ledger(&fx.layout.ledger_path());
        assert_eq!(ledger.agents["a1"].status, HeartbeatStatus::Stalled);
    }

    #[test]
    fn stalled_then_dead_escalates_again() {
        let fx = Fixture::new();
        let now = Utc::now();
        let record = silent_record("a1", 100, now);
        fx.write(&record);
        fx.watcher(FakeProbe::alive([100])).scan(now).expect("scan");

        let later = now + TimeDelta::seconds(300);
        let report = fx.watcher(FakeProbe::alive([])).scan(later).expect("scan");
        assert_eq!(report.findings[0].status, HeartbeatStatus::Dead);
        assert_eq!(report.findings[0].escalation, Some(EscalationKind::TerminalDead));
    }

    #[test]
    fn non_zero_exit_escalates_and_bad_files_are_skipped() {
        let fx = Fixture::new();
        let now = Utc::now();
        let mut record = silent_record("a1", 100, now);
        record.exit_code = Some(3);
        record.status = HeartbeatStatus::Exited;
        fx.write(&record);
        std::fs::write(fx.layout.state_dir().join("broken.json"), "{").expect("bad");

        let report = fx.watcher(FakeProbe::alive([])).scan(now).expect("scan");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].escalation, Some(EscalationKind::TerminalExit));
    }

    #[test]
    fn scan_stale_is_read_only() {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.write(&silent_record("a1", 100, now));
        let stale = scan_stale(&fx.layout, &FakeProbe::alive([100]), &THRESHOLDS, now)
            .expect("scan");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].status, HeartbeatStatus::Stalled);
        assert_eq!(stale[0].output_age_secs, 600);
        assert!(!fx.layout.ledger_path().exists());
        assert!(!fx.layout.events_path().exists());
    }
}
