//! Wrapper role: run one command under supervision and keep its heartbeat
//! record fresh.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::heartbeat::{HeartbeatRecord, HeartbeatStatus};
use crate::core::ids::validate_id;
use crate::io::heartbeat_store::{CommsLayout, write_record};
use crate::io::process::{kill_and_reap, kill_process_group, shell_command};
use crate::io::procfs::CpuSampler;
use crate::schedule::{SHUTDOWN_POLL, Shutdown};

/// How long tee threads may keep draining once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WrapOptions {
    pub agent_id: String,
    pub cmd: String,
    pub cwd: Option<PathBuf>,
    pub heartbeat: Duration,
    /// Copy child output to the wrapper's own stdout/stderr.
    pub echo: bool,
}

/// How the supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapOutcome {
    pub exit_code: Option<i32>,
    pub terminated: bool,
    pub record_path: PathBuf,
}

#[derive(Debug, Default)]
struct StreamStats {
    bytes_out: u64,
    bytes_err: u64,
    last_output_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Spawn `options.cmd`, tee its output to the agent log and rewrite the
/// heartbeat record every tick until it exits or `shutdown` fires.
#[instrument(skip_all, fields(agent_id = %options.agent_id))]
pub fn run_wrapped(layout: &CommsLayout, options: &WrapOptions, shutdown: &Shutdown) -> Result<WrapOutcome> {
    validate_id(&options.agent_id).context("agent_id")?;
    let record_path = layout.record_path(&options.agent_id)?;
    let log_path = layout.log_path(&options.agent_id)?;
    std::fs::create_dir_all(layout.logs_dir())
        .with_context(|| format!("create {}", layout.logs_dir().display()))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    let log = Arc::new(Mutex::new(log));

    let mut cmd = shell_command(&options.cmd);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn wrapped command '{}'", options.cmd))?;
    let pid = child.id();
    info!(pid, cmd = %options.cmd, "wrapped process started");

    let mut record = HeartbeatRecord::starting(&options.agent_id, pid, &options.cmd, Utc::now());
    write_record(&record_path, &record)?;

    let stats = Arc::new(Mutex::new(StreamStats::default()));
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;
    let readers = [
        spawn_tee(stdout, Stream::Out, log.clone(), stats.clone(), options.echo),
        spawn_tee(stderr, Stream::Err, log, stats.clone(), options.echo),
    ];

    let mut sampler = CpuSampler::new(pid);
    sampler.sample();
    let mut next_tick = Instant::now() + options.heartbeat;
    let mut terminated = false;
    let status = loop {
        if shutdown.is_requested() {
            warn!(pid, "shutdown requested, terminating wrapped process");
            terminated = true;
            break kill_and_reap(&mut child)?;
        }
        let wait = next_tick
            .saturating_duration_since(Instant::now())
            .min(SHUTDOWN_POLL);
        if let Some(status) = child.wait_timeout(wait).context("wait for wrapped process")? {
            break status;
        }
        if Instant::now() >= next_tick {
            record.cpu_percent = sampler.sample();
            refresh(&mut record, &stats, HeartbeatStatus::Running);
            if let Err(err) = write_record(&record_path, &record) {
                warn!(err = %format!("{err:#}"), "heartbeat write failed");
            }
            debug!(cpu_percent = record.cpu_percent, bytes_out = record.bytes_out, "tick");
            next_tick = Instant::now() + options.heartbeat;
        }
    };

    // Leftover group members would otherwise hold the pipes open.
    kill_process_group(pid);
    let drain_until = Instant::now() + DRAIN_GRACE;
    while !readers.iter().all(thread::JoinHandle::is_finished) && Instant::now() < drain_until {
        thread::sleep(Duration::from_millis(10));
    }
    for reader in readers {
        if !reader.is_finished() {
            warn!(pid, "output pipe still open after exit, abandoning tee");
        } else if reader.join().is_err() {
            warn!("output tee thread panicked");
        }
    }

    let exit_code = if terminated { None } else { Some(exit_code_of(status)) };
    record.exit_code = exit_code;
    record.cpu_percent = 0.0;
    refresh(
        &mut record,
        &stats,
        if terminated {
            HeartbeatStatus::Terminated
        } else {
            HeartbeatStatus::Exited
        },
    );
    write_record(&record_path, &record)?;
    info!(pid, exit_code = ?exit_code, terminated, "wrapped process finished");

    Ok(WrapOutcome {
        exit_code,
        terminated,
        record_path,
    })
}

fn refresh(record: &mut HeartbeatRecord, stats: &Mutex<StreamStats>, status: HeartbeatStatus) {
    if let Ok(stats) = stats.lock() {
        record.bytes_out = stats.bytes_out;
        record.bytes_err = stats.bytes_err;
        record.last_output_at = stats.last_output_at;
    }
    record.last_heartbeat_at = Utc::now();
    record.status = status;
}

fn spawn_tee<R: Read + Send + 'static>(
    mut reader: R,
    stream: Stream,
    log: Arc<Mutex<File>>,
    stats: Arc<Mutex<StreamStats>>,
    echo: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        let mut log_failed = false;
        let mut echo_failed = false;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(err = %err, "wrapped output closed");
                    break;
                }
            };
            let bytes = &chunk[..n];
            let logged = log
                .lock()
                .map_err(|_| std::io::Error::other("log lock poisoned"))
                .and_then(|mut log| log.write_all(bytes));
            if let Err(err) = logged
                && !log_failed
            {
                warn!(err = %err, "agent log write failed, further failures suppressed");
                log_failed = true;
            }
            if echo {
                let echoed = match stream {
                    Stream::Out => std::io::stdout().write_all(bytes),
                    Stream::Err => std::io::stderr().write_all(bytes),
                };
                if let Err(err) = echoed
                    && !echo_failed
                {
                    debug!(err = %err, "echo write failed, further failures suppressed");
                    echo_failed = true;
                }
            }
            if let Ok(mut stats) = stats.lock() {
                match stream {
                    Stream::Out => stats.bytes_out += n as u64,
                    Stream::Err => stats.bytes_err += n as u64,
                }
                stats.last_output_at = Some(Utc::now());
            }
        }
    })
}

/// Exit code, or `128 + signal` for a signal death.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::heartbeat_store::read_record;

    fn options(agent: &str, cmd: &str) -> WrapOptions {
        WrapOptions {
            agent_id: agent.to_string(),
            cmd: cmd.to_string(),
            cwd: None,
            heartbeat: Duration::from_millis(50),
            echo: false,
        }
    }

    #[test]
    fn records_bytes_exit_code_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = CommsLayout::new(temp.path());
        let outcome = run_wrapped(
            &layout,
            &options("a1", "echo hi; echo oops >&2; exit 3"),
            &Shutdown::new(),
        )
        .expect("wrap");

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.terminated);
        let record = read_record(&outcome.record_path).expect("record");
        assert_eq!(record.status, HeartbeatStatus::Exited);
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.bytes_out, 3);
        assert_eq!(record.bytes_err, 5);
        assert!(record.last_output_at.is_some());
        let log = std::fs::read_to_string(layout.log_path("a1").expect("log")).expect("read log");
        assert!(log.contains("hi"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn ticks_while_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = CommsLayout::new(temp.path());
        let outcome = run_wrapped(&layout, &options("a1", "sleep 0.3"), &Shutdown::new())
            .expect("wrap");
        let record = read_record(&outcome.record_path).expect("record");
        assert_eq!(record.exit_code, Some(0));
        assert!(record.last_heartbeat_at > record.started_at);
    }

    #[test]
    fn shutdown_terminates_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = CommsLayout::new(temp.path());
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.request();
        });
        let outcome =
            run_wrapped(&layout, &options("a1", "sleep 30"), &shutdown).expect("wrap");
        stopper.join().expect("join");

        assert!(outcome.terminated);
        assert_eq!(outcome.exit_code, None);
        let record = read_record(&outcome.record_path).expect("record");
        assert_eq!(record.status, HeartbeatStatus::Terminated);
    }

    #[test]
    fn exit_is_recorded_even_if_a_background_child_holds_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = CommsLayout::new(temp.path());
        let started = Instant::now();
        let outcome = run_wrapped(&layout, &options("a1", "sleep 30 & echo up"), &Shutdown::new())
            .expect("wrap");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.exit_code, Some(0));
        let record = read_record(&outcome.record_path).expect("record");
        assert_eq!(record.status, HeartbeatStatus::Exited);
        assert_eq!(record.bytes_out, 3);
    }

    #[test]
    fn tee_keeps_counting_when_the_log_is_unwritable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent.log");
        std::fs::write(&path, "").expect("create log");
        let read_only = File::open(&path).expect("open read-only");
        let stats = Arc::new(Mutex::new(StreamStats::default()));

        spawn_tee(
            std::io::Cursor::new(b"hello\n".to_vec()),
            Stream::Out,
            Arc::new(Mutex::new(read_only)),
            Arc::clone(&stats),
            false,
        )
        .join()
        .expect("tee thread");

        let stats = stats.lock().expect("stats");
        assert_eq!(stats.bytes_out, 6);
        assert!(stats.last_output_at.is_some());
        assert_eq!(std::fs::read_to_string(&path).expect("read log"), "");
    }

    #[test]
    fn rejects_bad_agent_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = CommsLayout::new(temp.path());
        assert!(run_wrapped(&layout, &options("../x", "true"), &Shutdown::new()).is_err());
    }
}
