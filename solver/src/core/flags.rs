//! Flag candidate detection and acceptance.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::core::types::{FlagCandidate, FlagSource};

pub const DEFAULT_FLAG_PATTERN: &str = r"pico[C:]?[T:]?F\{[^}]+\}";

/// Outcome of submitting a declared flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Accepted(String),
    /// The same flag was already accepted; nothing changed.
    AlreadyAccepted(String),
    Rejected(String),
}

/// Per-session flag state. At most one candidate is ever accepted.
#[derive(Debug, Clone)]
pub struct FlagTracker {
    search: Regex,
    exact: Regex,
    candidates: Vec<FlagCandidate>,
    accepted: Option<String>,
}

/// Serializable view of the tracker for transcripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub candidates: Vec<FlagCandidate>,
    pub accepted: Option<String>,
}

impl FlagTracker {
    pub fn new(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let search = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()?;
        let exact = RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(case_insensitive)
            .build()?;
        Ok(Self {
            search,
            exact,
            candidates: Vec::new(),
            accepted: None,
        })
    }

    pub fn candidates(&self) -> &[FlagCandidate] {
        &self.candidates
    }

    pub fn accepted(&self) -> Option<&str> {
        self.accepted.as_deref()
    }

    /// Record every pattern match in `text` as an unvalidated candidate.
    /// Returns only the candidates that were new.
    pub fn observe(&mut self, text: &str, source: FlagSource) -> Vec<String> {
        let mut fresh = Vec::new();
        for found in self.search.find_iter(text) {
            let raw = found.as_str();
            if self.candidates.iter().any(|c| c.raw == raw) {
                continue;
            }
            self.candidates.push(FlagCandidate {
                raw: raw.to_string(),
                source,
                validated: false,
            });
            fresh.push(raw.to_string());
        }
        fresh
    }

    /// Validate and accept a declared flag.
    pub fn submit(&mut self, raw: &str) -> Submission {
        let flag = raw.trim();
        if let Some(accepted) = &self.accepted {
            if accepted == flag {
                return Submission::AlreadyAccepted(flag.to_string());
            }
            return Submission::Rejected(format!(
                "a different flag was already accepted: {accepted}"
            ));
        }
        if !self.exact.is_match(flag) {
            return Submission::Rejected(format!(
                "'{flag}' does not match the expected flag format"
            ));
        }

        match self.candidates.iter_mut().find(|c| c.raw == flag) {
            Some(candidate) => candidate.validated = true,
            None => self.candidates.push(FlagCandidate {
                raw: flag.to_string(),
                source: FlagSource::Declared,
                validated: true,
            }),
        }
        self.accepted = Some(flag.to_string());
        Submission::Accepted(flag.to_string())
    }

    pub fn record(&self) -> FlagRecord {
        FlagRecord {
            candidates: self.candidates.clone(),
            accepted: self.accepted.clone(),
        }
    }
}
