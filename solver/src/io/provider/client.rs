//! Resilient provider client.
//!
//! Wraps a [`Provider`] with rate-limited admission, bounded retries with
//! exponential backoff and full jitter, cancellation, attempt records, and the
//! strict reply grammar (one corrective retry on a malformed reply).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::ProviderLimiter;
use super::{Completion, GenerationOptions, Provider, ProviderError};
use crate::core::reply::{ModelReply, parse_reply};
use crate::core::types::Message;
use crate::io::config::RetryConfig;

/// One provider attempt, successful or not. Never contains credentials or
/// message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `ok` or the error kind.
    pub outcome: String,
    pub error: Option<String>,
    /// Backoff slept after this attempt.
    pub backoff_ms: Option<u64>,
}

/// Outcome of asking for the next reply, plus the exchange messages that must
/// be appended to the transcript in order.
#[derive(Debug)]
pub struct ReplyExchange {
    pub messages: Vec<Message>,
    pub outcome: Result<ModelReply, ProviderError>,
}

pub struct ProviderClient {
    provider: Arc<dyn Provider>,
    limiter: Arc<ProviderLimiter>,
    max_attempts: u32,
    retry: RetryConfig,
    attempts: Mutex<Vec<AttemptRecord>>,
}

impl ProviderClient {
    pub fn new(
        provider: Arc<dyn Provider>,
        limiter: Arc<ProviderLimiter>,
        max_attempts: u32,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            max_attempts: max_attempts.max(1),
            retry,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, record: AttemptRecord) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn set_last_backoff(&self, backoff: Duration) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = attempts.last_mut() {
            last.backoff_ms = Some(backoff.as_millis() as u64);
        }
    }

    /// Send `conversation` and return the first successful completion.
    ///
    /// Transient and rate-limit failures share one attempt counter. Auth,
    /// quota and rejected requests fail on the attempt that produced them.
    /// The conversation is never modified.
    #[instrument(skip_all, fields(provider = self.provider.id(), messages = conversation.len()))]
    pub async fn send(
        &self,
        conversation: &[Message],
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let mut waited = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            tokio::select! {
                () = self.limiter.admit() => {}
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }

            let started_at = Utc::now();
            let started = Instant::now();
            let result = tokio::select! {
                result = tokio::time::timeout(
                    options.timeout,
                    self.provider.complete(conversation, options),
                ) => result.unwrap_or_else(|_| {
                    Err(ProviderError::transient(format!(
                        "no response within {}ms",
                        options.timeout.as_millis()
                    )))
                }),
                () = cancel.cancelled() => Err(ProviderError::Cancelled),
            };

            self.record(AttemptRecord {
                provider: self.provider.id().to_string(),
                attempt,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                outcome: match &result {
                    Ok(_) => "ok".to_string(),
                    Err(err) => err.kind().to_string(),
                },
                error: result.as_ref().err().map(ToString::to_string),
                backoff_ms: None,
            });

            let err = match result {
                Ok(completion) => {
                    debug!(attempt, "provider attempt succeeded");
                    return Ok(completion);
                }
                Err(err) => err,
            };
            if !err.is_retryable() {
                warn!(attempt, kind = err.kind(), "provider attempt failed, not retrying");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(attempt, kind = err.kind(), "provider attempts exhausted");
                return Err(err);
            }

            let hint = match &err {
                ProviderError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = backoff_delay(&self.retry, attempt, hint);
            if waited + delay > Duration::from_millis(self.retry.max_total_wait_ms) {
                warn!(
                    attempt,
                    waited_ms = waited.as_millis() as u64,
                    "retry wait budget exhausted"
                );
                return Err(err);
            }
            waited += delay;
            self.set_last_backoff(delay);
            info!(attempt, kind = err.kind(), delay_ms = delay.as_millis() as u64, "retrying provider request");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        }
    }

    /// Request the next reply and parse it with the strict grammar.
    ///
    /// A malformed reply is retried once with `corrective(error)` appended as a
    /// user turn. The rejected reply and the correction are returned in
    /// `messages` so they land in the transcript.
    #[instrument(skip_all, fields(provider = self.provider.id()))]
    pub async fn request_reply(
        &self,
        request: &[Message],
        options: &GenerationOptions,
        cancel: &CancellationToken,
        corrective: &(dyn Fn(&str) -> String + Sync),
    ) -> ReplyExchange {
        let mut messages = Vec::new();
        let mut conversation = request.to_vec();

        for round in 0..2 {
            let completion = match self.send(&conversation, options, cancel).await {
                Ok(completion) => completion,
                Err(err) => {
                    return ReplyExchange {
                        messages,
                        outcome: Err(err),
                    };
                }
            };
            let reply = Message::assistant(completion.text.clone());
            messages.push(reply.clone());

            match parse_reply(&completion.text) {
                Ok(parsed) => {
                    return ReplyExchange {
                        messages,
                        outcome: Ok(parsed),
                    };
                }
                Err(error) if round == 0 => {
                    warn!(error = %error, "malformed reply, sending correction");
                    let correction = Message::user(corrective(&error));
                    messages.push(correction.clone());
                    conversation.push(reply);
                    conversation.push(correction);
                }
                Err(error) => {
                    warn!(error = %error, "malformed reply after correction");
                    return ReplyExchange {
                        messages,
                        outcome: Err(ProviderError::Malformed { message: error }),
                    };
                }
            }
        }

        // The loop returns on every path of its second round.
        ReplyExchange {
            messages,
            outcome: Err(ProviderError::Malformed {
                message: "no reply".to_string(),
            }),
        }
    }
}

/// Delay before the retry that follows `attempt` (1-based).
///
/// A provider hint is honoured as given; otherwise the delay is drawn
/// uniformly from `0..=min(max_delay, base * 2^(attempt-1))`.
pub fn backoff_delay(retry: &RetryConfig, attempt: u32, hint: Option<Duration>) -> Duration {
    if let Some(hint) = hint {
        return hint;
    }
    let exponent = attempt.saturating_sub(1).min(20);
    let ceiling = retry
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.max_delay_ms);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}
