//! Stable exit codes for solver CLI commands.

/// Every session accepted a flag, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid input: bad config, policy, challenge directory, or arguments.
/// `solver check` also uses it for a DENY verdict.
pub const INVALID: i32 = 1;
/// At least one session ended in FAILED (and none was aborted).
pub const FAILED: i32 = 2;
/// At least one session was aborted (Ctrl-C or operator abort).
pub const ABORTED: i32 = 3;
