//! Stable exit codes for foreman CLI commands.

/// Command completed (guard failures are reported in the digest, not here).
pub const OK: i32 = 0;
/// Command failed at runtime (I/O, repo layout, unexpected errors).
pub const FAILED: i32 = 1;
/// Workflow or configuration was invalid; nothing was processed.
pub const CONFIG: i32 = 2;
/// Shutdown was requested before the pass completed.
pub const INTERRUPTED: i32 = 3;
