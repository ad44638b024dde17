//! Side-effecting adapters: filesystem stores, subprocesses, git, `/proc`.

pub mod atomic;
pub mod config;
pub mod digest;
pub mod escalation;
pub mod evidence;
pub mod git;
pub mod guards;
pub mod heartbeat_store;
pub mod inbox;
pub mod kv;
pub mod process;
pub mod procfs;
pub mod task_store;
pub mod workflow_loader;
pub mod workspace;
