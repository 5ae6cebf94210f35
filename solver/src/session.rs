//! Per-session state owned by the orchestration loop, and its transcript.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::core::flags::{FlagRecord, FlagTracker};
use crate::core::task_tree::{ROOT_ID, TaskStatus, TaskTree};
use crate::core::transitions::{Lifecycle, TransitionError, TransitionRecord};
use crate::core::types::{
    Decision, ExecutionResult, Message, SessionMode, SessionState, TerminalReason,
};
use crate::io::challenge::ChallengeMeta;
use crate::io::provider::client::AttemptRecord;

/// One executed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step: u32,
    pub tool: String,
    pub args: Vec<String>,
    /// Backend that ran the call when it went through a fallback chain.
    pub backend: Option<String>,
    /// Backends skipped as unavailable before `backend`.
    pub skipped: Vec<String>,
    pub result: ExecutionResult,
}

/// Everything needed to audit or resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: Uuid,
    pub parent_session: Option<Uuid>,
    pub challenge: ChallengeMeta,
    pub mode: SessionMode,
    pub state: SessionState,
    pub reason: Option<TerminalReason>,
    pub steps: u32,
    pub step_budget: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    pub tasks: TaskTree,
    pub flags: FlagRecord,
    pub decisions: Vec<Decision>,
    pub executions: Vec<ExecutionRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub attempts: Vec<AttemptRecord>,
}

impl Transcript {
    pub fn accepted_flag(&self) -> Option<&str> {
        self.flags.accepted.as_deref()
    }
}

/// A live session. Exclusively owned by one engine loop.
pub struct Session {
    pub id: Uuid,
    pub parent_session: Option<Uuid>,
    pub challenge: ChallengeMeta,
    pub mode: SessionMode,
    pub lifecycle: Lifecycle,
    pub steps: u32,
    pub step_budget: u32,
    pub cancel: CancellationToken,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    pub messages: Vec<Message>,
    pub tasks: TaskTree,
    pub flags: FlagTracker,
    pub decisions: Vec<Decision>,
    pub executions: Vec<ExecutionRecord>,
    /// Notes for the model, delivered with the next tool message.
    pub notes: Vec<String>,
}

impl Session {
    pub fn new(
        challenge: ChallengeMeta,
        mode: SessionMode,
        step_budget: u32,
        timeout: Duration,
        flags: FlagTracker,
        cancel: CancellationToken,
    ) -> Self {
        let started = Instant::now();
        Self {
            id: Uuid::new_v4(),
            parent_session: None,
            tasks: TaskTree::new(&challenge.title),
            challenge,
            mode,
            lifecycle: Lifecycle::default(),
            steps: 0,
            step_budget,
            cancel,
            started,
            started_at: Utc::now(),
            deadline: started + timeout,
            messages: Vec::new(),
            flags,
            decisions: Vec::new(),
            executions: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Start a fresh session that continues a terminal one.
    ///
    /// The prior conversation is carried over with a reset note, failed tasks
    /// are explicitly reset, and `parent_session` links back to the prior id.
    pub fn resume_from(
        prior: &Transcript,
        step_budget: u32,
        timeout: Duration,
        flags: FlagTracker,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if !prior.state.is_terminal() {
            return Err(anyhow!(
                "session {} is {:?}; only terminal sessions can be reset",
                prior.session_id,
                prior.state
            ));
        }
        let mut session = Self::new(
            prior.challenge.clone(),
            prior.mode,
            step_budget,
            timeout,
            flags,
            cancel,
        );
        session.parent_session = Some(prior.session_id);
        session.messages = prior.messages.clone();
        session.tasks = prior.tasks.clone();

        let failed: Vec<String> = session
            .tasks
            .nodes()
            .iter()
            .filter(|node| node.status == TaskStatus::Failed)
            .map(|node| node.id.clone())
            .collect();
        let mut reopened = Vec::new();
        for id in failed {
            reopened.extend(session.tasks.reset(&id)?);
        }
        if session
            .tasks
            .get(ROOT_ID)
            .is_some_and(|root| root.status.is_terminal())
        {
            reopened.extend(session.tasks.reset(ROOT_ID)?);
        }

        let outcome = prior
            .reason
            .as_ref()
            .map(|reason| format!("{reason:?}"))
            .unwrap_or_else(|| format!("{:?}", prior.state));
        session.messages.push(Message::user(format!(
            "[session {} was reset from {} ({outcome}); you have a fresh budget of {step_budget} steps]",
            session.id, prior.session_id
        )));
        info!(
            session = %session.id,
            parent = %prior.session_id,
            reopened = reopened.len(),
            "session reset"
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn advance(&mut self, to: SessionState) -> Result<(), TransitionError> {
        let from = self.lifecycle.state();
        self.lifecycle.advance(to)?;
        info!(session = %self.id, ?from, ?to, steps = self.steps, "state transition");
        Ok(())
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn steps_remaining(&self) -> u32 {
        self.step_budget.saturating_sub(self.steps)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn transcript(
        &self,
        reason: Option<TerminalReason>,
        attempts: Vec<AttemptRecord>,
    ) -> Transcript {
        Transcript {
            session_id: self.id,
            parent_session: self.parent_session,
            challenge: self.challenge.clone(),
            mode: self.mode,
            state: self.state(),
            reason,
            steps: self.steps,
            step_budget: self.step_budget,
            started_at: self.started_at,
            finished_at: self.state().is_terminal().then(Utc::now),
            messages: self.messages.clone(),
            tasks: self.tasks.clone(),
            flags: self.flags.record(),
            decisions: self.decisions.clone(),
            executions: self.executions.clone(),
            transitions: self.lifecycle.history().to_vec(),
            attempts,
        }
    }
}
