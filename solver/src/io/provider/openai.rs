//! OpenAI-compatible chat completions backend (OpenAI, DeepSeek).

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

pub struct OpenAiCompatible {
    id: String,
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatible {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            id: config.id.as_str().to_string(),
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            model: config.model.clone(),
            api_key: config.credential.clone(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: std::borrow::Cow<'a, str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn to_wire(messages: &[Message]) -> Vec<ChatMessage<'_>> {
    messages
        .iter()
        .map(|message| match message.role {
            Role::Tool => ChatMessage {
                role: Role::User.as_str(),
                content: tool_result_text(&message.content).into(),
            },
            role => ChatMessage {
                role: role.as_str(),
                content: message.content.as_str().into(),
            },
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiCompatible {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(provider = %self.id, model = %self.model))]
    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: to_wire(messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::transient(format!("unparseable response body: {err}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::transient("response contained no choices"))?;
        let text = choice.message.content.unwrap_or_default();
        debug!(bytes = text.len(), "completion received");
        Ok(Completion {
            text,
            model: parsed.model,
        })
    }
}
