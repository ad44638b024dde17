//! Filesystem-coordinated task orchestration for a fleet of workers.
//!
//! Tasks move through the states of a declarative workflow only when the
//! guard commands bound to their current state succeed. Workers talk through
//! file-drop inboxes, and a watchdog supervises their processes through
//! heartbeat files. The shared filesystem is the only transport and the only
//! source of truth.
//!
//! - **[`core`]**: Pure, deterministic logic (data types, workflow checks,
//!   transition resolution, heartbeat classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (task store, inbox transport, guard
//!   execution, git, `/proc`, digests, configuration).
//!
//! Orchestration modules ([`fsm`], [`batch`], [`bridge`], [`watch`], [`wrap`])
//! compose the two into the roles the CLI runs. Every polling role is a
//! [`schedule::Pass`].

pub mod batch;
pub mod bridge;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod fsm;
pub mod io;
pub mod logging;
pub mod schedule;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watch;
pub mod wrap;
