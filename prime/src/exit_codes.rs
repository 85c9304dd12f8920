//! Stable exit codes for the `prime` and `prime-server` binaries.

/// Command succeeded or the task completed.
pub const OK: i32 = 0;
/// Invalid input, configuration, or an unknown task id.
pub const INVALID: i32 = 1;
/// `prime run` finished with a `failed` task.
pub const FAILED: i32 = 2;
/// `prime run` finished with a `cancelled` task.
pub const CANCELLED: i32 = 3;
/// A self-update was applied; a supervisor should start the new version.
pub const RESTART: i32 = 75;
