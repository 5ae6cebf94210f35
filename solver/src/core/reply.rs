//! Strict grammar for model replies.
//!
//! Model output is untrusted. A reply is accepted only when it carries exactly
//! one JSON object (the whole reply, or a single fenced block) that validates
//! against `schemas/model_reply.schema.json`. Everything else is malformed.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::core::task_tree::TaskStatus;
use crate::core::types::{ProposedAction, TOOL_READ_FILE, TOOL_SCRIPT};

const REPLY_SCHEMA: &str = include_str!("../../schemas/model_reply.schema.json");

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(?:json)?[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(REPLY_SCHEMA).map_err(|err| format!("parse reply schema: {err}"))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| format!("compile reply schema: {err}"))
});

/// Task tree update carried alongside any reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Action(ProposedAction),
    Flag(String),
    AskHuman(String),
}

/// A reply that passed the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub kind: ReplyKind,
    pub thought: Option<String>,
    pub tasks: Vec<TaskUpdate>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(flatten)]
    body: Body,
    thought: Option<String>,
    #[serde(default)]
    tasks: Vec<TaskUpdate>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Body {
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        stdin: Option<String>,
    },
    Script {
        language: String,
        code: String,
    },
    ReadFile {
        path: String,
    },
    Flag {
        flag: String,
    },
    AskHuman {
        question: String,
    },
}

/// Parse a raw model reply. Errors are stable, human-readable descriptions
/// suitable for the corrective instruction sent back to the model.
pub fn parse_reply(text: &str) -> Result<ModelReply, String> {
    let payload = extract_payload(text)?;
    let instance: Value =
        serde_json::from_str(payload).map_err(|err| format!("invalid JSON: {err}"))?;

    let validator = VALIDATOR.as_ref().map_err(Clone::clone)?;
    let messages: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "reply does not match the action grammar:\n- {}",
            messages.join("\n- ")
        ));
    }

    let envelope: Envelope =
        serde_json::from_value(instance).map_err(|err| format!("invalid reply: {err}"))?;
    let raw = text.to_string();
    let kind = match envelope.body {
        Body::Command {
            command,
            args,
            stdin,
        } => ReplyKind::Action(ProposedAction {
            tool: command,
            args,
            stdin,
            raw,
        }),
        Body::Script { language, code } => ReplyKind::Action(ProposedAction {
            tool: TOOL_SCRIPT.to_string(),
            args: vec![language],
            stdin: Some(code),
            raw,
        }),
        Body::ReadFile { path } => ReplyKind::Action(ProposedAction {
            tool: TOOL_READ_FILE.to_string(),
            args: vec![path],
            stdin: None,
            raw,
        }),
        Body::Flag { flag } => ReplyKind::Flag(flag),
        Body::AskHuman { question } => ReplyKind::AskHuman(question),
    };

    Ok(ModelReply {
        kind,
        thought: envelope.thought,
        tasks: envelope.tasks,
    })
}

fn extract_payload(text: &str) -> Result<&str, String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return Ok(trimmed);
    }

    let blocks: Vec<&str> = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| body.starts_with('{'))
        .collect();

    match blocks.as_slice() {
        [] => Err("no JSON object found in reply".to_string()),
        [single] => Ok(single),
        many => Err(format!(
            "expected exactly one JSON block, found {}",
            many.len()
        )),
    }
}
