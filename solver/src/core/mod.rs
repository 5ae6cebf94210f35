//! Deterministic, pure logic shared by the solver.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod flags;
pub mod reply;
pub mod task_tree;
pub mod transitions;
pub mod types;
pub mod window;
