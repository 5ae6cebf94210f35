//! Prompt rendering.
//!
//! The engine treats rendered prompts as opaque text. Templates ship with the
//! binary and can be overridden per kind with `<prompts_dir>/<kind>.md`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;
use tracing::debug;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CHALLENGE_INTRO_TEMPLATE: &str = include_str!("prompts/challenge_intro.md");
const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");
const VERIFICATION_TEMPLATE: &str = include_str!("prompts/verification.md");
const HUMAN_FEEDBACK_TEMPLATE: &str = include_str!("prompts/human_feedback.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    System,
    ChallengeIntro,
    Continuation,
    Verification,
    HumanFeedback,
    Correction,
}

impl PromptKind {
    pub const ALL: [PromptKind; 6] = [
        PromptKind::System,
        PromptKind::ChallengeIntro,
        PromptKind::Continuation,
        PromptKind::Verification,
        PromptKind::HumanFeedback,
        PromptKind::Correction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::System => "system",
            PromptKind::ChallengeIntro => "challenge_intro",
            PromptKind::Continuation => "continuation",
            PromptKind::Verification => "verification",
            PromptKind::HumanFeedback => "human_feedback",
            PromptKind::Correction => "correction",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            PromptKind::System => SYSTEM_TEMPLATE,
            PromptKind::ChallengeIntro => CHALLENGE_INTRO_TEMPLATE,
            PromptKind::Continuation => CONTINUATION_TEMPLATE,
            PromptKind::Verification => VERIFICATION_TEMPLATE,
            PromptKind::HumanFeedback => HUMAN_FEEDBACK_TEMPLATE,
            PromptKind::Correction => CORRECTION_TEMPLATE,
        }
    }
}

/// Variables supplied by the engine. Templates use what they need.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptVars {
    pub title: String,
    pub category: String,
    pub description: String,
    pub files: Vec<String>,
    pub mode: String,
    pub languages: Vec<String>,
    /// Short description of the action whose result is being reported.
    pub action: String,
    pub result: String,
    pub candidates: Vec<String>,
    pub notes: Vec<String>,
    pub task_summary: String,
    pub steps_remaining: u32,
    pub question: String,
    pub guidance: String,
    pub error: String,
}

pub trait PromptProvider: Send + Sync {
    fn render(&self, kind: PromptKind, vars: &PromptVars) -> Result<String>;
}

/// minijinja-backed prompt provider.
pub struct TemplatePrompts {
    env: Environment<'static>,
    overrides: HashMap<PromptKind, String>,
}

impl TemplatePrompts {
    /// Built-in templates, with any `<kind>.md` found in `override_dir`
    /// taking precedence.
    pub fn new(override_dir: Option<&Path>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        for kind in PromptKind::ALL {
            env.add_template(kind.as_str(), kind.builtin())
                .with_context(|| format!("compile {} template", kind.as_str()))?;
        }

        let mut overrides = HashMap::new();
        if let Some(dir) = override_dir {
            for kind in PromptKind::ALL {
                let path = dir.join(format!("{}.md", kind.as_str()));
                if !path.exists() {
                    continue;
                }
                let source = fs::read_to_string(&path)
                    .with_context(|| format!("read prompt template {}", path.display()))?;
                debug!(kind = kind.as_str(), path = %path.display(), "using prompt override");
                overrides.insert(kind, source);
            }
        }

        Ok(Self { env, overrides })
    }
}

impl PromptProvider for TemplatePrompts {
    fn render(&self, kind: PromptKind, vars: &PromptVars) -> Result<String> {
        let rendered = match self.overrides.get(&kind) {
            Some(source) => self.env.render_str(source, vars),
            None => self.env.get_template(kind.as_str())?.render(vars),
        }
        .with_context(|| format!("render {} prompt", kind.as_str()))?;
        Ok(rendered.trim().to_string())
    }
}
