//! Orchestration loop.
//!
//! One engine serves many concurrent sessions. Shared state is limited to the
//! read-only policy, the script chains (whose probe cache is internally
//! synchronised), and the per-provider rate limiters. Each session is driven
//! strictly sequentially: request a reply, act on it, report back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::{remaining_budget, tightest};
use crate::core::classifier::SecurityPolicy;
use crate::core::flags::{FlagTracker, Submission};
use crate::core::reply::{ReplyKind, TaskUpdate};
use crate::core::types::{
    FlagSource, Message, ProposedAction, Role, SessionMode, SessionState, TerminalReason, Verdict,
};
use crate::core::window::request_window;
use crate::dispatch::{DispatchOutcome, Dispatcher, describe_action};
use crate::io::challenge::{ChallengeMeta, ResultSink};
use crate::io::config::EngineConfig;
use crate::io::human::{HumanGate, HumanReply};
use crate::io::prompt::{PromptKind, PromptProvider, PromptVars};
use crate::io::provider::client::ProviderClient;
use crate::io::provider::rate_limit::RateLimiterRegistry;
use crate::io::provider::{GenerationOptions, Provider, ProviderError};
use crate::io::scripts::ScriptRunner;
use crate::session::{ExecutionRecord, Session, Transcript};

/// Task tree lines included in prompts.
const TASK_SUMMARY_NODES: usize = 40;

/// Result of one finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub reason: TerminalReason,
    pub transcript: Transcript,
    /// Where the transcript was written, when a sink is configured.
    pub saved_to: Option<PathBuf>,
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        self.transcript.state
    }
}

/// Whether the loop keeps going after a model turn.
enum Flow {
    Continue,
    Stop(TerminalReason),
}

pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn Provider>,
    limiters: Arc<RateLimiterRegistry>,
    dispatcher: Dispatcher,
    prompts: Arc<dyn PromptProvider>,
    human: Arc<dyn HumanGate>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        policy: Arc<SecurityPolicy>,
        prompts: Arc<dyn PromptProvider>,
        human: Arc<dyn HumanGate>,
    ) -> Result<Self> {
        config.validate()?;
        let scripts = Arc::new(ScriptRunner::from_config(&config.scripts));
        let dispatcher = Dispatcher::new(policy, scripts, config.session.output_limit_bytes);
        Ok(Self {
            limiters: Arc::new(RateLimiterRegistry::new(config.rate_limit.clone())),
            config,
            provider,
            dispatcher,
            prompts,
            human,
            sink: None,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn flag_tracker(&self) -> Result<FlagTracker> {
        FlagTracker::new(&self.config.flags.pattern, self.config.flags.case_insensitive)
            .context("compile flag pattern")
    }

    fn client(&self) -> ProviderClient {
        ProviderClient::new(
            Arc::clone(&self.provider),
            self.limiters.limiter_for(self.provider.id()),
            self.config.provider.max_retries.saturating_add(1),
            self.config.retry.clone(),
        )
    }

    /// Run a fresh session to a terminal state.
    #[instrument(skip_all, fields(challenge = %challenge.name, mode = mode.as_str()))]
    pub async fn run_session(
        &self,
        challenge: ChallengeMeta,
        mode: SessionMode,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        let session = Session::new(
            challenge,
            mode,
            self.config.session.step_budget,
            self.config.session.session_timeout(),
            self.flag_tracker()?,
            cancel,
        );
        info!(session = %session.id, budget = session.step_budget, "session started");
        self.finish(session).await
    }

    /// Continue a terminal session as a new, linked session.
    #[instrument(skip_all, fields(prior = %prior.session_id))]
    pub async fn resume(
        &self,
        prior: &Transcript,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        let session = Session::resume_from(
            prior,
            self.config.session.step_budget,
            self.config.session.session_timeout(),
            self.flag_tracker()?,
            cancel,
        )?;
        self.finish(session).await
    }

    async fn finish(&self, mut session: Session) -> Result<SessionOutcome> {
        let client = self.client();
        let reason = match self.drive(&mut session, &client).await {
            Ok(reason) => reason,
            Err(err) => {
                error!(session = %session.id, error = %format!("{err:#}"), "session loop failed");
                TerminalReason::Internal {
                    error: format!("{err:#}"),
                }
            }
        };

        let target = reason.state();
        if session.state() != target
            && let Err(err) = session.advance(target)
        {
            // Only Done can be refused here, and only from a non-LLM state.
            warn!(session = %session.id, error = %err, "forcing failed state");
            session.advance(SessionState::Failed)?;
        }
        info!(
            session = %session.id,
            state = ?session.state(),
            reason = ?reason,
            steps = session.steps,
            "session finished"
        );

        let transcript = session.transcript(Some(reason.clone()), client.attempts());
        let saved_to = match &self.sink {
            Some(sink) => match sink.persist(&transcript) {
                Ok(path) => Some(path),
                Err(err) => {
                    error!(session = %transcript.session_id, error = %format!("{err:#}"), "failed to persist transcript");
                    None
                }
            },
            None => None,
        };
        Ok(SessionOutcome {
            reason,
            transcript,
            saved_to,
        })
    }

    fn base_vars(&self, session: &Session) -> PromptVars {
        PromptVars {
            title: session.challenge.title.clone(),
            category: session.challenge.category.clone(),
            description: session.challenge.description.clone(),
            files: session.challenge.files.clone(),
            mode: session.mode.as_str().to_string(),
            languages: self.dispatcher.script_languages(),
            task_summary: session.tasks.summary(TASK_SUMMARY_NODES),
            steps_remaining: session.steps_remaining(),
            ..PromptVars::default()
        }
    }

    fn correction(&self, error: &str) -> String {
        let vars = PromptVars {
            error: error.to_string(),
            ..PromptVars::default()
        };
        self.prompts
            .render(PromptKind::Correction, &vars)
            .unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "correction prompt failed to render");
                format!("Your last reply was rejected: {error}. Reply with exactly one JSON object.")
            })
    }

    fn timed_out(session: &Session) -> TerminalReason {
        TerminalReason::SessionTimeout {
            elapsed_ms: session.elapsed().as_millis() as u64,
        }
    }

    async fn drive(&self, session: &mut Session, client: &ProviderClient) -> Result<TerminalReason> {
        if session.messages.is_empty() {
            let vars = self.base_vars(session);
            let system = self.prompts.render(PromptKind::System, &vars)?;
            let intro = self.prompts.render(PromptKind::ChallengeIntro, &vars)?;
            session.push(Message::system(system));
            session.push(Message::user(intro));
        }
        session.advance(SessionState::AwaitingLlm)?;

        let provider_timeout = Duration::from_secs(self.config.provider.timeout_secs);
        loop {
            if session.cancel.is_cancelled() {
                return Ok(TerminalReason::Cancelled);
            }
            if session.steps >= session.step_budget {
                return Ok(TerminalReason::BudgetExceeded {
                    steps: session.steps,
                    budget: session.step_budget,
                });
            }
            let Some(remaining) = remaining_budget(session.deadline) else {
                return Ok(Self::timed_out(session));
            };

            let options = GenerationOptions {
                temperature: self.config.session.temperature,
                max_tokens: self.config.session.max_tokens,
                timeout: provider_timeout.min(remaining),
            };
            let request = request_window(&session.messages, self.config.session.context_budget_bytes);
            let corrective = |error: &str| self.correction(error);
            let exchange = match tokio::time::timeout(
                remaining,
                client.request_reply(&request, &options, &session.cancel, &corrective),
            )
            .await
            {
                Ok(exchange) => exchange,
                Err(_) => return Ok(Self::timed_out(session)),
            };

            let reply_text = exchange
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone());
            session.messages.extend(exchange.messages);
            let reply = match exchange.outcome {
                Ok(reply) => reply,
                Err(ProviderError::Cancelled) => return Ok(TerminalReason::Cancelled),
                Err(ProviderError::Malformed { message }) => {
                    return Ok(TerminalReason::MalformedResponse { error: message });
                }
                Err(err) => {
                    return Ok(TerminalReason::ProviderFatal {
                        error: err.to_string(),
                    });
                }
            };

            if !matches!(reply.kind, ReplyKind::Flag(_))
                && let Some(text) = &reply_text
            {
                let fresh = session.flags.observe(text, FlagSource::ModelText);
                if !fresh.is_empty() {
                    debug!(session = %session.id, candidates = ?fresh, "flag candidates in model text");
                }
            }
            apply_task_updates(session, &reply.tasks);

            let flow = match reply.kind {
                ReplyKind::Flag(flag) => self.on_flag(session, &flag),
                ReplyKind::AskHuman(question) => self.on_question(session, &question).await?,
                ReplyKind::Action(action) => self.on_action(session, &action).await?,
            };
            if let Flow::Stop(reason) = flow {
                return Ok(reason);
            }
        }
    }

    fn on_flag(&self, session: &mut Session, flag: &str) -> Flow {
        match session.flags.submit(flag) {
            Submission::Accepted(flag) | Submission::AlreadyAccepted(flag) => {
                info!(session = %session.id, %flag, "flag accepted");
                Flow::Stop(TerminalReason::FlagAccepted { flag })
            }
            Submission::Rejected(why) => {
                info!(session = %session.id, reason = %why, "flag rejected");
                session.steps += 1;
                session.push(Message::user(format!(
                    "[flag rejected] {why}. Steps remaining: {}.",
                    session.steps_remaining()
                )));
                Flow::Continue
            }
        }
    }

    async fn on_question(&self, session: &mut Session, question: &str) -> Result<Flow> {
        if session.mode == SessionMode::Auto {
            session.steps += 1;
            session.push(Message::user(format!(
                "No human is available in this session. Continue on your own. Steps remaining: {}.",
                session.steps_remaining()
            )));
            return Ok(Flow::Continue);
        }

        session.advance(SessionState::AwaitingHuman)?;
        let Some(remaining) = remaining_budget(session.deadline) else {
            return Ok(Flow::Stop(Self::timed_out(session)));
        };
        let id = session.id.to_string();
        let reply = tokio::select! {
            reply = self.human.ask(&id, question) => reply?,
            () = session.cancel.cancelled() => return Ok(Flow::Stop(TerminalReason::Cancelled)),
            () = tokio::time::sleep(remaining) => return Ok(Flow::Stop(Self::timed_out(session))),
        };

        let guidance = match reply {
            HumanReply::Abort => return Ok(Flow::Stop(TerminalReason::HumanAbort)),
            HumanReply::Proceed => "(the operator had no answer)".to_string(),
            HumanReply::Guidance(text) => text,
        };
        session.steps += 1;
        let vars = PromptVars {
            question: question.to_string(),
            guidance,
            ..self.base_vars(session)
        };
        let text = self.prompts.render(PromptKind::HumanFeedback, &vars)?;
        session.push(Message::user(text));
        session.advance(SessionState::AwaitingLlm)?;
        Ok(Flow::Continue)
    }

    async fn on_action(&self, session: &mut Session, action: &ProposedAction) -> Result<Flow> {
        session.advance(SessionState::ExecutingTool)?;
        let id = session.id.to_string();
        let decision = self.dispatcher.classify(&id, action);
        session.decisions.push(decision.clone());
        let described = describe_action(action);

        if decision.verdict == Verdict::Deny {
            let outcome = DispatchOutcome::Refused {
                message: format!(
                    "'{}' is not permitted: {}",
                    decision.command,
                    decision.reason.describe()
                ),
            };
            self.report(session, &described, &outcome, Vec::new())?;
            return Ok(Flow::Continue);
        }

        if session.mode == SessionMode::Hitl && decision.needs_human() {
            session.advance(SessionState::AwaitingHuman)?;
            let Some(remaining) = remaining_budget(session.deadline) else {
                return Ok(Flow::Stop(Self::timed_out(session)));
            };
            let reason = decision.reason.describe();
            let reply = tokio::select! {
                reply = self.human.confirm(&id, &described, &reason) => reply?,
                () = session.cancel.cancelled() => return Ok(Flow::Stop(TerminalReason::Cancelled)),
                () = tokio::time::sleep(remaining) => return Ok(Flow::Stop(Self::timed_out(session))),
            };
            match reply {
                HumanReply::Abort => return Ok(Flow::Stop(TerminalReason::HumanAbort)),
                HumanReply::Guidance(guidance) => {
                    info!(session = %session.id, action = %described, "action declined by operator");
                    let outcome = DispatchOutcome::Refused {
                        message: format!("the operator declined to run it: {guidance}"),
                    };
                    self.report(session, &described, &outcome, Vec::new())?;
                    return Ok(Flow::Continue);
                }
                HumanReply::Proceed => session.advance(SessionState::ExecutingTool)?,
            }
        }

        let Some(timeout) = tightest(self.config.session.tool_timeout(), session.deadline) else {
            return Ok(Flow::Stop(Self::timed_out(session)));
        };
        let outcome = self
            .dispatcher
            .execute(&decision, action, &session.challenge.root, timeout, &session.cancel)
            .await;

        let mut fresh = Vec::new();
        if let DispatchOutcome::Executed {
            result,
            backend,
            skipped,
        } = &outcome
        {
            fresh.extend(session.flags.observe(&result.stdout, FlagSource::ToolOutput));
            fresh.extend(session.flags.observe(&result.stderr, FlagSource::ToolOutput));
            session.executions.push(ExecutionRecord {
                step: session.steps + 1,
                tool: action.tool.clone(),
                args: action.args.clone(),
                backend: backend.clone(),
                skipped: skipped.clone(),
                result: result.clone(),
            });
        }
        if outcome.was_cancelled() {
            return Ok(Flow::Stop(TerminalReason::Cancelled));
        }
        if !fresh.is_empty() {
            info!(session = %session.id, candidates = ?fresh, "flag candidates in tool output");
        }
        self.report(session, &described, &outcome, fresh)?;
        Ok(Flow::Continue)
    }

    /// Append the single tool message for this visit and return to the model.
    fn report(
        &self,
        session: &mut Session,
        action: &str,
        outcome: &DispatchOutcome,
        candidates: Vec<String>,
    ) -> Result<()> {
        session.steps += 1;
        let kind = if candidates.is_empty() {
            PromptKind::Continuation
        } else {
            PromptKind::Verification
        };
        let vars = PromptVars {
            action: action.to_string(),
            result: outcome.render(),
            candidates,
            notes: std::mem::take(&mut session.notes),
            ..self.base_vars(session)
        };
        let text = self.prompts.render(kind, &vars)?;
        session.push(Message::tool(text));
        session.advance(SessionState::AwaitingLlm)?;
        Ok(())
    }
}

/// Apply model task updates. Invalid ones become notes for the next tool message.
fn apply_task_updates(session: &mut Session, updates: &[TaskUpdate]) {
    for update in updates {
        if let Err(err) = session.tasks.apply_update(update) {
            warn!(session = %session.id, task = %update.id, error = %err, "task update rejected");
            session.notes.push(format!("task update '{}' rejected: {err}", update.id));
        }
    }
}
