//! Test-only helpers: scripted provider and operator, scratch challenges, and
//! reply builders.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use crate::core::types::Message;
use crate::engine::Engine;
use crate::io::challenge::{CHALLENGE_FILE, ChallengeMeta, load_challenge};
use crate::io::config::EngineConfig;
use crate::io::human::{HumanGate, HumanReply};
use crate::io::policy::load_policy;
use crate::io::prompt::TemplatePrompts;
use crate::io::provider::{Completion, GenerationOptions, Provider, ProviderError};

/// One canned provider response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(ProviderError),
    /// Sleep before answering; used to exercise cancellation and timeouts.
    Delayed(Duration, String),
}

/// Provider that replays a fixed queue and records every request.
///
/// An exhausted queue answers with a non-retryable rejection, so a test that
/// under-scripts a session ends it in FAILED instead of hanging.
pub struct ScriptedProvider {
    id: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            id: "scripted".to_string(),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a queue of plain text replies.
    pub fn texts<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            replies
                .into_iter()
                .map(|r| ScriptedReply::Text(r.into()))
                .collect(),
        )
    }

    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<Completion, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let text = match next {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Error(err)) => return Err(err),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            None => {
                return Err(ProviderError::Rejected {
                    status: 0,
                    message: "scripted provider exhausted".to_string(),
                });
            }
        };
        Ok(Completion {
            text,
            model: Some("scripted".to_string()),
        })
    }
}

/// Operator that replays fixed answers and records what it was shown.
#[derive(Default)]
pub struct ScriptedHuman {
    replies: Mutex<VecDeque<HumanReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedHuman {
    pub fn new(replies: Vec<HumanReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Everything the operator was asked, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next(&self, prompt: String) -> HumanReply {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt);
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(HumanReply::Abort)
    }
}

#[async_trait]
impl HumanGate for ScriptedHuman {
    async fn confirm(&self, _session: &str, action: &str, _reason: &str) -> Result<HumanReply> {
        Ok(self.next(format!("confirm: {action}")))
    }

    async fn ask(&self, _session: &str, question: &str) -> Result<HumanReply> {
        Ok(self.next(format!("ask: {question}")))
    }
}

/// Scratch challenge directory with a `challenge.toml`.
pub struct TestChallenge {
    temp: TempDir,
    dir: PathBuf,
}

impl TestChallenge {
    pub fn new(name: &str, description: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let dir = temp.path().join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let body = format!("title = {name:?}\ncategory = \"misc\"\ndescription = {description:?}\n");
        fs::write(dir.join(CHALLENGE_FILE), body).context("write challenge.toml")?;
        Ok(Self { temp, dir })
    }

    pub fn with_file(self, relative: &str, contents: &str) -> Result<Self> {
        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Scratch space next to the challenge (not inside it).
    pub fn scratch(&self) -> &Path {
        self.temp.path()
    }

    pub fn meta(&self) -> Result<ChallengeMeta> {
        load_challenge(&self.dir)
    }
}

/// Config with small budgets and fast retries.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.step_budget = 10;
    config.session.session_timeout_secs = 60;
    config.session.tool_timeout_secs = 10;
    config.provider.timeout_secs = 10;
    config.provider.max_retries = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.rate_limit.requests_per_minute = 6_000;
    config.rate_limit.burst = 100;
    config
}

/// Engine over the default policy and built-in prompts.
pub fn test_engine(
    config: EngineConfig,
    provider: Arc<dyn Provider>,
    human: Arc<dyn HumanGate>,
) -> Result<Engine> {
    Engine::new(
        config,
        provider,
        load_policy(None)?,
        Arc::new(TemplatePrompts::new(None)?),
        human,
    )
}

pub fn command_reply(command: &str, args: &[&str]) -> String {
    json!({"type": "command", "command": command, "args": args}).to_string()
}

pub fn script_reply(language: &str, code: &str) -> String {
    json!({"type": "script", "language": language, "code": code}).to_string()
}

pub fn read_file_reply(path: &str) -> String {
    json!({"type": "read_file", "path": path}).to_string()
}

pub fn flag_reply(flag: &str) -> String {
    json!({"type": "flag", "flag": flag}).to_string()
}

pub fn ask_reply(question: &str) -> String {
    json!({"type": "ask_human", "question": question}).to_string()
}
