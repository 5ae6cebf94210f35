//! Session lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

/// Whether `from -> to` is a legal edge.
pub fn is_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Aborted, AwaitingHuman, AwaitingLlm, Done, ExecutingTool, Failed, Init};

    if from.is_terminal() {
        return false;
    }
    if matches!(to, Failed | Aborted) {
        return true;
    }
    matches!(
        (from, to),
        (Init, AwaitingLlm)
            | (AwaitingLlm, ExecutingTool | Done | AwaitingHuman)
            | (ExecutingTool, AwaitingHuman | AwaitingLlm)
            | (AwaitingHuman, ExecutingTool | AwaitingLlm)
    )
}

/// Current state plus the full transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    state: SessionState,
    history: Vec<TransitionRecord>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: SessionState::Init,
            history: Vec::new(),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Number of times `state` was entered.
    pub fn visits(&self, state: SessionState) -> usize {
        self.history.iter().filter(|r| r.to == state).count()
    }

    pub fn advance(&mut self, to: SessionState) -> Result<(), TransitionError> {
        let from = self.state;
        if !is_allowed(from, to) {
            return Err(TransitionError { from, to });
        }
        self.history.push(TransitionRecord {
            from,
            to,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }
}
