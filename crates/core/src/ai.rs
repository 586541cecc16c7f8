//! Text-completion boundary used by `ai` conflict resolution.
//!
//! [`TextCompletion`] is the seam; [`OpenAiCompatibleClient`] talks to any
//! endpoint that speaks the OpenAI chat completions API (OpenAI, LM
//! Studio, Ollama, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::AiConfig;
use crate::errors::CompletionError;

/// Something that turns a prompt into text.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

const SYSTEM_PROMPT: &str = "You resolve merge conflicts in source files touched by \
                             dependency updates. Answer only in the requested format.";

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client.
pub struct OpenAiCompatibleClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            timeout: Duration::from_secs(60),
            client: reqwest::Client::new(),
        }
    }

    /// Build from the `[ai]` section. Returns `None` when ai is disabled.
    ///
    /// A missing key is allowed; local servers usually need none.
    pub fn from_config(config: &AiConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.api_key.is_none() {
            warn!(
                env = %config.api_key_env,
                "no api key resolved, sending unauthenticated requests"
            );
        }
        let mut client = Self::new(&config.endpoint, &config.model, config.api_key.clone());
        client.timeout = Duration::from_secs(config.timeout_secs.max(1));
        Some(client)
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl TextCompletion for OpenAiCompatibleClient {
    #[instrument(skip(self, prompt), fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: 1024,
            temperature: 0.1,
        };

        let mut request = self
            .client
            .post(self.chat_url())
            .json(&body)
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or(CompletionError::EmptyResponse)?;

        debug!(chars = text.len(), "completion received");
        Ok(text)
    }
}
