//! File-drop inbox transport.
//!
//! Each agent owns `<inbox_root>/<agent>/` with four subdirectories:
//!
//! - `inbox/` holds pending envelopes, one JSON file each;
//! - `processing/` holds envelopes claimed by a consumer (claimed by rename,
//!   so only one consumer ever wins a given file);
//! - `archive/` holds dispatched envelopes;
//! - `rejected/` holds files that did not parse.
//!
//! Expired envelopes are deleted without dispatch. Dot-prefixed names are
//! in-flight temp files and are never picked up.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::envelope::{Envelope, MessageType};
use crate::core::ids::validate_id;
use crate::error::FleetError;
use crate::io::atomic::{is_hidden, random_suffix, write_json_atomic};
use crate::schedule::{Pass, Shutdown};

pub const PENDING_DIR: &str = "inbox";
pub const PROCESSING_DIR: &str = "processing";
pub const ARCHIVE_DIR: &str = "archive";
pub const REJECTED_DIR: &str = "rejected";
pub const ESCALATIONS_DIR: &str = "escalations";

/// Root of all agent inboxes.
#[derive(Debug, Clone)]
pub struct Inbox {
    root: PathBuf,
    default_ttl: Option<u64>,
}

impl Inbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_ttl: None,
        }
    }

    /// TTL stamped on envelopes enqueued without one.
    pub fn with_default_ttl(mut self, ttl_s: Option<u64>) -> Self {
        self.default_ttl = ttl_s;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agent_dirs(&self, agent: &str) -> Result<AgentDirs> {
        validate_id(agent)?;
        Ok(AgentDirs::new(self.root.join(agent)))
    }

    pub fn escalations_dir(&self, agent: &str) -> Result<PathBuf> {
        validate_id(agent)?;
        Ok(self.root.join(agent).join(ESCALATIONS_DIR))
    }

    /// Atomically drop `envelope` into `to`'s pending directory.
    #[instrument(skip_all, fields(to, kind = envelope.kind.as_str()))]
    pub fn enqueue(&self, to: &str, envelope: &Envelope) -> Result<PathBuf> {
        let dirs = self.agent_dirs(to)?;
        let mut envelope = envelope.clone();
        if envelope.ttl_s.is_none() {
            envelope.ttl_s = self.default_ttl;
        }
        let path = dirs.pending.join(message_file_name(&envelope.from, Utc::now()));
        write_json_atomic(&path, &envelope)?;
        debug!(path = %path.display(), "enqueued");
        Ok(path)
    }

    /// Poller over `agent`'s pending directory.
    pub fn poller<'a>(&self, agent: &str, handlers: Handlers<'a>) -> Result<Poller<'a>> {
        Ok(Poller::new(self.agent_dirs(agent)?, handlers))
    }
}

/// `<UTC timestamp with nanos>-<sender>-<random>.json`. Lexical order follows
/// send order per sender.
fn message_file_name(sender: &str, now: DateTime<Utc>) -> String {
    let sender: String = sender
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!(
        "{}-{sender}-{}.json",
        now.format("%Y%m%dT%H%M%S%9fZ"),
        random_suffix(6)
    )
}

/// Directories owned by one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDirs {
    pub pending: PathBuf,
    pub processing: PathBuf,
    pub archive: PathBuf,
    pub rejected: PathBuf,
}

impl AgentDirs {
    pub fn new(agent_root: impl AsRef<Path>) -> Self {
        let root = agent_root.as_ref();
        Self {
            pending: root.join(PENDING_DIR),
            processing: root.join(PROCESSING_DIR),
            archive: root.join(ARCHIVE_DIR),
            rejected: root.join(REJECTED_DIR),
        }
    }

    fn create_all(&self) -> Result<()> {
        for dir in [&self.pending, &self.processing, &self.archive, &self.rejected] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Pending envelope files, oldest name first.
    pub fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.pending) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.pending.display()));
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read {}", self.pending.display()))?
                .path();
            if is_hidden(&path) || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }
}

pub type Handler<'a> = Box<dyn FnMut(&Envelope) -> Result<()> + 'a>;

/// Handlers keyed by message type. Types with no handler are a no-op.
#[derive(Default)]
pub struct Handlers<'a> {
    by_kind: HashMap<MessageType, Handler<'a>>,
}

impl<'a> Handlers<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, kind: MessageType, handler: impl FnMut(&Envelope) -> Result<()> + 'a) -> Self {
        self.by_kind.insert(kind, Box::new(handler));
        self
    }

    /// `None` if no handler is registered for the envelope's type.
    pub fn dispatch(&mut self, envelope: &Envelope) -> Option<Result<()>> {
        self.by_kind
            .get_mut(&envelope.kind)
            .map(|handler| handler(envelope))
    }
}

/// What happened to one discovered envelope file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A handler ran. `handled` is false if it returned an error.
    Dispatched {
        file: PathBuf,
        kind: MessageType,
        handled: bool,
    },
    /// No handler for this type; archived untouched.
    Ignored { file: PathBuf, kind: MessageType },
    /// TTL elapsed before discovery; deleted.
    Expired { file: PathBuf },
    /// Not a valid envelope; moved to `rejected/`.
    Malformed { file: PathBuf, error: String },
}

impl Delivery {
    /// Archived or deleted location of the envelope, by original file name.
    pub fn file(&self) -> &Path {
        match self {
            Self::Dispatched { file, .. }
            | Self::Ignored { file, .. }
            | Self::Expired { file }
            | Self::Malformed { file, .. } => file,
        }
    }
}

/// Consumes one agent's pending directory.
pub struct Poller<'a> {
    dirs: AgentDirs,
    handlers: Handlers<'a>,
}

impl<'a> Poller<'a> {
    pub fn new(dirs: AgentDirs, handlers: Handlers<'a>) -> Self {
        Self { dirs, handlers }
    }

    pub fn dirs(&self) -> &AgentDirs {
        &self.dirs
    }

    /// Claim and deliver every pending envelope once, in name order.
    #[instrument(skip_all, fields(inbox = %self.dirs.pending.display()))]
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<Vec<Delivery>> {
        self.dirs.create_all()?;
        let mut deliveries = Vec::new();
        for pending in self.dirs.pending_files()? {
            let Some(claimed) = self.claim(&pending) else {
                continue;
            };
            deliveries.push(self.deliver(&claimed, now));
        }
        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "inbox scan delivered");
        }
        Ok(deliveries)
    }

    /// Lazy, unbounded sequence of deliveries, scanning every `interval`.
    ///
    /// Ends only when `shutdown` is requested.
    pub fn poll<'p>(&'p mut self, interval: Duration, shutdown: &'p Shutdown) -> Poll<'p, 'a> {
        Poll {
            poller: self,
            interval,
            shutdown,
            buffered: VecDeque::new(),
            scanned: false,
        }
    }

    fn claim(&self, pending: &Path) -> Option<PathBuf> {
        let name = pending.file_name()?;
        let claimed = self.dirs.processing.join(name);
        match fs::rename(pending, &claimed) {
            Ok(()) => Some(claimed),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(file = %pending.display(), "claimed by another consumer");
                None
            }
            Err(err) => {
                warn!(file = %pending.display(), err = %err, "claim failed");
                None
            }
        }
    }

    fn deliver(&mut self, claimed: &Path, now: DateTime<Utc>) -> Delivery {
        let envelope = match read_envelope(claimed) {
            Ok(envelope) => envelope,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(file = %claimed.display(), err = %error, "rejecting malformed envelope");
                let file = self.settle(claimed, &self.dirs.rejected);
                return Delivery::Malformed { file, error };
            }
        };

        if envelope.is_expired(now) {
            debug!(file = %claimed.display(), "dropping expired envelope");
            if let Err(err) = fs::remove_file(claimed) {
                warn!(file = %claimed.display(), err = %err, "remove expired envelope failed");
            }
            return Delivery::Expired {
                file: claimed.to_path_buf(),
            };
        }

        let kind = envelope.kind;
        let outcome = self.handlers.dispatch(&envelope);
        let file = self.settle(claimed, &self.dirs.archive);
        match outcome {
            None => {
                debug!(kind = kind.as_str(), "no handler, ignoring");
                Delivery::Ignored { file, kind }
            }
            Some(Ok(())) => {
                info!(kind = kind.as_str(), from = %envelope.from, "dispatched");
                Delivery::Dispatched {
                    file,
                    kind,
                    handled: true,
                }
            }
            Some(Err(err)) => {
                warn!(kind = kind.as_str(), err = %format!("{err:#}"), "handler failed");
                Delivery::Dispatched {
                    file,
                    kind,
                    handled: false,
                }
            }
        }
    }

    /// Move a claimed file to its final directory. A failed move leaves it in
    /// `processing/`, which is never rescanned.
    fn settle(&self, claimed: &Path, dest_dir: &Path) -> PathBuf {
        let Some(name) = claimed.file_name() else {
            return claimed.to_path_buf();
        };
        let dest = dest_dir.join(name);
        match fs::rename(claimed, &dest) {
            Ok(()) => dest,
            Err(err) => {
                warn!(file = %claimed.display(), err = %err, "settle failed");
                claimed.to_path_buf()
            }
        }
    }
}

impl Pass for Poller<'_> {
    fn name(&self) -> &'static str {
        "inbox"
    }

    fn run_once(&mut self) -> Result<()> {
        self.poll_once(Utc::now())?;
        Ok(())
    }
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).map_err(|err| {
        FleetError::Transport {
            path: path.display().to_string(),
            message: err.to_string(),
        }
        .into()
    })
}

/// Iterator returned by [`Poller::poll`].
pub struct Poll<'p, 'a> {
    poller: &'p mut Poller<'a>,
    interval: Duration,
    shutdown: &'p Shutdown,
    buffered: VecDeque<Delivery>,
    scanned: bool,
}

impl Iterator for Poll<'_, '_> {
    type Item = Delivery;

    fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.buffered.pop_front() {
                return Some(delivery);
            }
            if self.shutdown.is_requested() {
                return None;
            }
            if self.scanned && !self.shutdown.sleep(self.interval) {
                return None;
            }
            self.scanned = true;
            match self.poller.poll_once(Utc::now()) {
                Ok(batch) => self.buffered.extend(batch),
                Err(err) => warn!(err = %format!("{err:#}"), "inbox scan failed"),
            }
        }
    }
}
