//! Human-in-the-loop boundary.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanReply {
    /// Confirm the pending action, or decline to answer a question.
    Proceed,
    /// Free-form guidance. For a pending action this also declines it.
    Guidance(String),
    Abort,
}

impl HumanReply {
    /// Interpret one line of operator input.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "y" | "yes" | "ok" => HumanReply::Proceed,
            "abort" | "q" | "quit" => HumanReply::Abort,
            _ => HumanReply::Guidance(trimmed.to_string()),
        }
    }
}

#[async_trait]
pub trait HumanGate: Send + Sync {
    /// Ask the operator to confirm `action` before it runs.
    async fn confirm(&self, session: &str, action: &str, reason: &str) -> Result<HumanReply>;

    /// Relay a question from the model.
    async fn ask(&self, session: &str, question: &str) -> Result<HumanReply>;
}

/// Terminal operator on stdin/stderr. One prompt at a time across sessions.
pub struct StdinHuman {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl Default for StdinHuman {
    fn default() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl StdinHuman {
    async fn prompt(&self, text: &str) -> Result<HumanReply> {
        let mut lines = self.lines.lock().await;
        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(text.as_bytes())
            .await
            .context("write operator prompt")?;
        stderr.flush().await.context("flush operator prompt")?;
        let line = lines
            .next_line()
            .await
            .context("read operator input")?
            .ok_or_else(|| anyhow!("operator input closed"))?;
        Ok(HumanReply::parse(&line))
    }
}

#[async_trait]
impl HumanGate for StdinHuman {
    #[instrument(skip(self, action, reason))]
    async fn confirm(&self, session: &str, action: &str, reason: &str) -> Result<HumanReply> {
        self.prompt(&format!(
            "\n[{session}] confirm action: {action}\n  reason: {reason}\n  [Enter/y] run, text = skip with guidance, 'abort' = stop > "
        ))
        .await
    }

    #[instrument(skip(self, question))]
    async fn ask(&self, session: &str, question: &str) -> Result<HumanReply> {
        self.prompt(&format!(
            "\n[{session}] the model asks: {question}\n  answer (empty = no answer, 'abort' = stop) > "
        ))
        .await
    }
}
