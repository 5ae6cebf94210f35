//! Shared deterministic types for the solver core.
//!
//! These types define stable contracts between components and are serialized
//! verbatim into session transcripts, so variant names are part of the
//! on-disk format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One entry of the append-only session conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Whether risky actions pause for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Auto,
    Hitl,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Auto => "auto",
            SessionMode::Hitl => "hitl",
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    AwaitingLlm,
    ExecutingTool,
    AwaitingHuman,
    Done,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed | SessionState::Aborted
        )
    }
}

/// An action the model asked the engine to perform.
///
/// Built-in capabilities use reserved tool names (`read_file`, `script`);
/// anything else is a program name executed with `args` as its argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub tool: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Raw model text the action was parsed from.
    pub raw: String,
}

pub const TOOL_READ_FILE: &str = "read_file";
pub const TOOL_SCRIPT: &str = "script";

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    Deny,
    AllowAudit,
}

impl Verdict {
    pub fn permits_execution(self) -> bool {
        !matches!(self, Verdict::Deny)
    }
}

/// Why the classifier reached its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ReasonCode {
    DenyListed,
    AllowListed { category: String },
    HeuristicAllow { pattern: String },
    HeuristicDeny { pattern: String },
    InvalidProgramName,
    DefaultClosed,
}

impl ReasonCode {
    pub fn describe(&self) -> String {
        match self {
            ReasonCode::DenyListed => "command is on the deny list".to_string(),
            ReasonCode::AllowListed { category } => format!("allow-listed ({category})"),
            ReasonCode::HeuristicAllow { pattern } => {
                format!("unknown command matched heuristic '{pattern}'")
            }
            ReasonCode::HeuristicDeny { pattern } => {
                format!("command matched deny heuristic '{pattern}'")
            }
            ReasonCode::InvalidProgramName => {
                "program name contains whitespace or shell metacharacters".to_string()
            }
            ReasonCode::DefaultClosed => "unknown command (default deny)".to_string(),
        }
    }
}

/// Immutable classifier output for one proposed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Normalized program name the verdict applies to.
    pub command: String,
    pub args: Vec<String>,
    pub verdict: Verdict,
    pub reason: ReasonCode,
    /// Allowed but destructive-class: HITL sessions confirm before running.
    pub requires_confirmation: bool,
}

impl Decision {
    /// True for ALLOW_AUDIT, which must be logged separately from ALLOW.
    pub fn audited(&self) -> bool {
        self.verdict == Verdict::AllowAudit
    }

    pub fn needs_human(&self) -> bool {
        self.audited() || self.requires_confirmation
    }
}

/// Outcome of a bounded tool execution.
///
/// Non-zero exits, timeouts and truncation are data for the model, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
    /// Killed because the session was cancelled.
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Render the result the way it is shown to the model.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        match self.exit_code {
            Some(code) => buf.push_str(&format!("exit code: {code}\n")),
            None => buf.push_str("exit code: none (killed)\n"),
        }
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.truncated {
            buf.push_str("\n[output truncated]");
        }
        if self.timed_out {
            buf.push_str("\n[command timed out]");
        }
        buf
    }
}

/// Where a flag candidate was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    ToolOutput,
    ModelText,
    Declared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCandidate {
    pub raw: String,
    pub source: FlagSource,
    pub validated: bool,
}

/// Reason a session reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    FlagAccepted { flag: String },
    BudgetExceeded { steps: u32, budget: u32 },
    SessionTimeout { elapsed_ms: u64 },
    ProviderFatal { error: String },
    MalformedResponse { error: String },
    Internal { error: String },
    Cancelled,
    HumanAbort,
}

impl TerminalReason {
    pub fn state(&self) -> SessionState {
        match self {
            TerminalReason::FlagAccepted { .. } => SessionState::Done,
            TerminalReason::Cancelled | TerminalReason::HumanAbort => SessionState::Aborted,
            _ => SessionState::Failed,
        }
    }
}
