//! LLM-driven solver for capture-the-flag challenges.
//!
//! A session asks a model for one action at a time, classifies it against a
//! command policy, runs it in a bounded subprocess, and feeds the result back
//! until a flag is accepted or a budget runs out. The layout follows a strict
//! split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, reply grammar,
//!   task tree, lifecycle, flag tracking, context window). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, providers, subprocesses,
//!   script engines, prompts, challenge files, operator input).
//!
//! [`engine`] drives sessions by combining the two; [`dispatch`] is the
//! security-gated path from a proposed action to its result.

pub mod core;
pub mod dispatch;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
