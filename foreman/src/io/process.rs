//! Bounded child processes: deadline, capped capture, kill on shutdown.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::schedule::{SHUTDOWN_POLL, Shutdown};

/// Bytes kept from one stream, plus how many were read and thrown away.
#[derive(Debug, Default)]
pub struct Capture {
    pub kept: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    /// Lossy UTF-8 text with a trailing notice when bytes were dropped.
    pub fn text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.kept).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{label} truncated {} bytes]\n", self.dropped));
        }
        text
    }

    fn absorb(&mut self, bytes: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.kept.len()).min(bytes.len());
        self.kept.extend_from_slice(&bytes[..room]);
        self.dropped += bytes.len() - room;
    }
}

/// One output pipe drained on its own thread into a shared [`Capture`].
struct PipeReader {
    capture: Arc<Mutex<Capture>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R, limit: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = Arc::clone(&capture);
        let handle = thread::spawn(move || -> Result<()> {
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).context("read child output")?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .map_err(|_| anyhow!("capture lock poisoned"))?
                    .absorb(&chunk[..n], limit);
            }
        });
        Self { capture, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Everything captured so far. A reader still blocked on an open pipe is
    /// left detached.
    fn collect(self) -> Result<Capture> {
        if self.handle.is_finished() {
            self.handle
                .join()
                .map_err(|_| anyhow!("output reader panicked"))??;
        }
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| anyhow!("capture lock poisoned"))?;
        Ok(std::mem::take(&mut *capture))
    }
}

/// How a bounded child run ended.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    pub timed_out: bool,
    /// Killed because shutdown was requested.
    pub cancelled: bool,
}

/// `sh -c <script>` in its own process group, so a kill reaches the whole
/// pipeline and not only the shell.
pub fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Grace for pipes to drain after the process group has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run `cmd` to completion, killing it at `timeout` or on shutdown.
///
/// Both pipes are drained on reader threads while the child runs, so a chatty
/// child cannot block on a full pipe. At most `output_limit_bytes` per stream
/// are kept. Once the child is reaped its process group is killed, so
/// backgrounded descendants neither outlive the command nor hold its pipes
/// open. A pipe still open at the deadline (a descendant that left the group)
/// counts as a timeout.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    shutdown: Option<&Shutdown>,
) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn command")?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let readers = [
        PipeReader::spawn(stdout, output_limit_bytes),
        PipeReader::spawn(stderr, output_limit_bytes),
    ];
    let pid = child.id();

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if shutdown.is_some_and(Shutdown::is_requested) {
            warn!(pid, "shutdown requested, killing child");
            cancelled = true;
            break kill_and_reap(&mut child)?;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            warn!(pid, "deadline reached, killing child");
            timed_out = true;
            break kill_and_reap(&mut child)?;
        }
        if let Some(status) = child
            .wait_timeout(left.min(SHUTDOWN_POLL))
            .context("wait for child")?
        {
            break status;
        }
    };

    kill_process_group(pid);
    let drain_until = deadline.max(Instant::now() + DRAIN_GRACE);
    if !wait_for_readers(&readers, drain_until, shutdown) {
        if shutdown.is_some_and(Shutdown::is_requested) {
            cancelled = true;
        } else {
            timed_out = true;
        }
        warn!(pid, timed_out, cancelled, "output pipes still open, abandoning readers");
    }
    let [stdout_reader, stderr_reader] = readers;
    let stdout = stdout_reader.collect().context("collect stdout")?;
    let stderr = stderr_reader.collect().context("collect stderr")?;
    if stdout.dropped + stderr.dropped > 0 {
        debug!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output over limit"
        );
    }
    debug!(code = ?status.code(), timed_out, cancelled, "child finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        cancelled,
    })
}

/// SIGKILL the child's process group, then the child itself, and reap it.
pub fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "child already gone");
    }
    child.wait().context("reap killed child")
}

/// SIGKILL every process in group `pgid`. An empty group is not an error.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "process group killed"),
        Err(Errno::ESRCH) => {}
        Err(errno) => warn!(pgid, %errno, "process group kill failed"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) {}

/// Poll until every reader hit EOF, `until` passes or shutdown fires.
fn wait_for_readers(readers: &[PipeReader], until: Instant, shutdown: Option<&Shutdown>) -> bool {
    loop {
        if readers.iter().all(PipeReader::is_finished) {
            return true;
        }
        if Instant::now() >= until || shutdown.is_some_and(Shutdown::is_requested) {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
