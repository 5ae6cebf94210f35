//! Side-effecting adapters used by the engine.

pub mod challenge;
pub mod config;
pub mod fallback;
pub mod human;
pub mod policy;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod scripts;
