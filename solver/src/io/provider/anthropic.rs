//! Anthropic messages API backend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    Completion, GenerationOptions, Provider, ProviderError, map_http_error, map_transport_error,
    parse_retry_after, tool_result_text,
};
use crate::core::types::{Message, Role};
use crate::io::config::ProviderConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct Anthropic {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl Anthropic {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/messages", config.base_url),
            model: config.model.clone(),
            api_key: config.credential.clone(),
        })
    }
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

/// Hoist system messages and merge consecutive same-role turns, which the
/// messages API requires to alternate.
fn to_wire(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
    let mut system: Vec<&str> = Vec::new();
    let mut wire: Vec<WireMessage> = Vec::new();

    for message in messages {
        let (role, content) = match message.role {
            Role::System => {
                system.push(&message.content);
                continue;
            }
            Role::User => ("user", message.content.clone()),
            Role::Tool => ("user", tool_result_text(&message.content)),
            Role::Assistant => ("assistant", message.content.clone()),
        };
        match wire.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&content);
            }
            _ => wire.push(WireMessage { role, content }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, wire)
}

#[async_trait]
impl Provider for Anthropic {
    fn id(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip_all, fields(provider = "anthropic", model = %self.model))]
    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion, ProviderError> {
        let (system, messages) = to_wire(messages);
        let body = CreateMessageRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system,
            messages,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get("retry-after"));
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status.as_u16(), &text, retry_after));
        }

        let parsed: CreateMessageResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::transient(format!("unparseable response body: {err}")))?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        debug!(bytes = text.len(), "completion received");
        Ok(Completion {
            text,
            model: parsed.model,
        })
    }
}
