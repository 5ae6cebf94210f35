//! LLM provider abstraction.
//!
//! A [`Provider`] performs exactly one HTTP exchange per call. Retries,
//! backoff, rate limiting and reply validation live in [`client`].

pub mod anthropic;
pub mod client;
pub mod openai;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use thiserror::Error;

use crate::core::types::Message;
use crate::io::config::{ProviderConfig, ProviderKind};

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

/// Text returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider error{}: {message}", status_suffix(.status))]
    Transient { status: Option<u16>, message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed model reply: {message}")]
    Malformed { message: String },
    #[error("request cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. } | ProviderError::RateLimited { .. }
        )
    }

    /// Short stable label for attempt records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient { .. } => "transient",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Auth { .. } => "auth",
            ProviderError::QuotaExceeded { .. } => "quota_exceeded",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Malformed { .. } => "malformed",
            ProviderError::Cancelled => "cancelled",
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            status: None,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id, also the rate-limiter key.
    fn id(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion, ProviderError>;
}

/// Build the HTTP backend for `config`.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(match config.id {
        ProviderKind::OpenAi | ProviderKind::DeepSeek => {
            Arc::new(openai::OpenAiCompatible::new(config)?)
        }
        ProviderKind::Anthropic => Arc::new(anthropic::Anthropic::new(config)?),
    })
}

const QUOTA_MARKERS: &[&str] = &["insufficient_quota", "billing", "credit balance"];

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn map_http_error(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> ProviderError {
    let message = error_message(body);
    let lowered = body.to_lowercase();
    let hard_quota = QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker));

    match status {
        401 | 403 => ProviderError::Auth { status, message },
        402 => ProviderError::QuotaExceeded { message },
        429 if hard_quota => ProviderError::QuotaExceeded { message },
        429 => ProviderError::RateLimited {
            retry_after,
            message,
        },
        408 | 500..=599 => ProviderError::Transient {
            status: Some(status),
            message,
        },
        _ => ProviderError::Rejected { status, message },
    }
}

pub(crate) fn map_transport_error(err: &reqwest::Error) -> ProviderError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request failed: {err}")
    };
    ProviderError::transient(message)
}

pub(crate) fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.error.message;
    }
    let trimmed = body.trim();
    if trimmed.len() <= 500 {
        return trimmed.to_string();
    }
    let mut end = 500;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

/// Text sent in place of the engine's `tool` role, which neither wire format has.
pub(crate) fn tool_result_text(content: &str) -> String {
    format!("[tool result]\n{content}")
}
