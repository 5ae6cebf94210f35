//! Deterministic security classification of proposed commands.
//!
//! Rules are evaluated in a fixed order:
//! 1. exact deny set -> `Deny` (arguments are never consulted)
//! 2. exact allow set, keyed by capability category -> `Allow`
//! 3. heuristic patterns for unknown names: any deny pattern -> `Deny`,
//!    otherwise any allow pattern -> `AllowAudit`, otherwise `Deny`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::{Decision, ReasonCode, Verdict};

/// Characters that would carry meaning to a shell. Program names containing
/// them are rejected before any lookup.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '*', '?', '!', '~', '\'', '"', '\\',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

/// Pattern associated with a known tool family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heuristic {
    pub pattern: String,
    #[serde(rename = "match")]
    pub kind: MatchKind,
    #[serde(default)]
    pub effect: Effect,
}

impl Heuristic {
    fn matches(&self, name: &str) -> bool {
        match self.kind {
            MatchKind::Prefix => name.starts_with(&self.pattern),
            MatchKind::Suffix => name.ends_with(&self.pattern),
            MatchKind::Substring => name.contains(&self.pattern),
        }
    }
}

/// Serialized policy tables (see `policy/default.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    /// Destructive or administrative commands, denied regardless of arguments.
    pub deny: Vec<String>,
    /// Capability category -> allowed command names.
    pub allow: BTreeMap<String, Vec<String>>,
    /// Allowed commands that still pause for confirmation in HITL sessions.
    pub confirm: Vec<String>,
    pub heuristics: Vec<Heuristic>,
}

impl PolicySpec {
    /// Check table consistency. Returns stable error messages (empty on success).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let deny: HashSet<String> = self.deny.iter().map(|name| name.to_lowercase()).collect();

        for name in &self.deny {
            if normalize_program(name).as_deref() != Some(name.to_lowercase().as_str()) {
                errors.push(format!("deny: '{name}' is not a bare program name"));
            }
        }

        let mut allowed = HashSet::new();
        for (category, names) in &self.allow {
            for name in names {
                let lowered = name.to_lowercase();
                if normalize_program(name).as_deref() != Some(lowered.as_str()) {
                    errors.push(format!(
                        "allow.{category}: '{name}' is not a bare program name"
                    ));
                }
                if deny.contains(&lowered) {
                    errors.push(format!(
                        "allow.{category}: '{name}' is also on the deny list"
                    ));
                }
                allowed.insert(lowered);
            }
        }

        for name in &self.confirm {
            if !allowed.contains(&name.to_lowercase()) {
                errors.push(format!("confirm: '{name}' is not allow-listed"));
            }
        }

        for (idx, heuristic) in self.heuristics.iter().enumerate() {
            if heuristic.pattern.trim().is_empty() {
                errors.push(format!("heuristics[{idx}]: pattern must be non-empty"));
            }
        }

        errors
    }
}

/// Process-wide, read-only classification tables.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    deny: HashSet<String>,
    allow: HashMap<String, String>,
    confirm: HashSet<String>,
    heuristics: Vec<Heuristic>,
}

impl SecurityPolicy {
    pub fn from_spec(spec: &PolicySpec) -> Result<Self, String> {
        let errors = spec.validate();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        let mut allow = HashMap::new();
        for (category, names) in &spec.allow {
            for name in names {
                // First category listed (BTreeMap order) wins for duplicates.
                allow
                    .entry(name.to_lowercase())
                    .or_insert_with(|| category.clone());
            }
        }

        Ok(Self {
            deny: spec.deny.iter().map(|name| name.to_lowercase()).collect(),
            allow,
            confirm: spec.confirm.iter().map(|name| name.to_lowercase()).collect(),
            heuristics: spec
                .heuristics
                .iter()
                .map(|h| Heuristic {
                    pattern: h.pattern.to_lowercase(),
                    ..h.clone()
                })
                .collect(),
        })
    }

    /// Classify `command` with `args`. Arguments are recorded but never change
    /// the verdict: the program is later run with an argv, not a shell string.
    pub fn classify(&self, command: &str, args: &[String]) -> Decision {
        let Some(name) = normalize_program(command) else {
            return decision(command, args, Verdict::Deny, ReasonCode::InvalidProgramName);
        };

        if self.deny.contains(&name) {
            return decision(&name, args, Verdict::Deny, ReasonCode::DenyListed);
        }

        if let Some(category) = self.allow.get(&name) {
            let mut allowed = decision(
                &name,
                args,
                Verdict::Allow,
                ReasonCode::AllowListed {
                    category: category.clone(),
                },
            );
            allowed.requires_confirmation = self.confirm.contains(&name);
            return allowed;
        }

        // Deny patterns take precedence over allow patterns in this tier.
        if let Some(h) = self
            .heuristics
            .iter()
            .find(|h| h.effect == Effect::Deny && h.matches(&name))
        {
            let reason = ReasonCode::HeuristicDeny {
                pattern: h.pattern.clone(),
            };
            return decision(&name, args, Verdict::Deny, reason);
        }
        if let Some(h) = self
            .heuristics
            .iter()
            .find(|h| h.effect == Effect::Allow && h.matches(&name))
        {
            let reason = ReasonCode::HeuristicAllow {
                pattern: h.pattern.clone(),
            };
            return decision(&name, args, Verdict::AllowAudit, reason);
        }

        decision(&name, args, Verdict::Deny, ReasonCode::DefaultClosed)
    }

    /// True when `program` is allow-listed but destructive-class.
    pub fn requires_confirmation(&self, program: &str) -> bool {
        normalize_program(program).is_some_and(|name| self.confirm.contains(&name))
    }

    pub fn category_of(&self, command: &str) -> Option<&str> {
        let name = normalize_program(command)?;
        self.allow.get(&name).map(String::as_str)
    }
}

fn decision(command: &str, args: &[String], verdict: Verdict, reason: ReasonCode) -> Decision {
    Decision {
        command: command.to_string(),
        args: args.to_vec(),
        verdict,
        reason,
        requires_confirmation: false,
    }
}

/// Reduce a program reference to its lowercase basename.
///
/// Returns `None` for empty names or names carrying whitespace or shell
/// metacharacters, so `/usr/bin/rm` and `rm` classify identically.
pub fn normalize_program(command: &str) -> Option<String> {
    if command.is_empty()
        || command
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || SHELL_METACHARACTERS.contains(&c))
    {
        return None;
    }
    let base = Path::new(command).file_name()?.to_str()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_lowercase())
}
