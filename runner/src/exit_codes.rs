//! Stable exit codes for runner CLI commands.

/// Command succeeded or the execution completed.
pub const OK: i32 = 0;
/// Invalid request, layout, or config, or any other command error.
pub const INVALID: i32 = 1;
/// The execution ended with status `FAILED`.
pub const FAILED: i32 = 2;
/// The execution was cancelled.
pub const CANCELLED: i32 = 3;
/// The execution ended with status `TIMEOUT`.
pub const TIMEOUT: i32 = 4;
