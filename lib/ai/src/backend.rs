//! Completion provider seam.
//!
//! AI node kinds build an [`LlmRequest`] and call an [`LlmBackend`]; they
//! never see provider wire formats. [`ScriptedBackend`] replays canned
//! completions for tests.

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Which kind of endpoint a backend talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Ollama's `/v1` endpoint.
    Ollama,
    /// api.openai.com.
    OpenAi,
    /// Any gateway speaking the chat completions format.
    OpenAiCompatible,
    /// Canned completions.
    Scripted,
}

impl LlmProvider {
    /// Returns the string representation of this provider.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai-compatible",
            Self::Scripted => "scripted",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint, model and credentials of a completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBackendConfig {
    pub provider: LlmProvider,
    /// Host, `/v1` base or full completions URL.
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when present.
    pub api_key: Option<String>,
    /// Per-call deadline.
    pub timeout_seconds: u64,
}

impl LlmBackendConfig {
    /// Configuration for an OpenAI-compatible endpoint with a 30s deadline.
    #[must_use]
    pub fn openai_compatible(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider: LlmProvider::OpenAiCompatible,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            timeout_seconds: 30,
        }
    }
}

/// One completion call: an optional system prompt and a user prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Constrain output to a single JSON object where the provider can.
    pub json_object: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// A plain-text request for `prompt`.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            json_object: false,
            temperature: None,
            max_tokens: None,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Requests JSON-object output.
    #[must_use]
    pub fn json_object(mut self) -> Self {
        self.json_object = true;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Chat messages for the request, system prompt first.
    #[must_use]
    pub fn messages(&self) -> Vec<LlmMessage> {
        self.system
            .iter()
            .map(|system| LlmMessage::system(system.clone()))
            .chain(std::iter::once(LlmMessage::user(self.prompt.clone())))
            .collect()
    }
}

/// A chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: String,
}

impl LlmMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

/// Text produced by a completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Raw model output; AI kinds parse it themselves.
    pub content: String,
    pub usage: TokenUsage,
    /// Model reported by the provider.
    pub model: String,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Input plus output tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A completion provider.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Runs one completion.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable completion text was produced.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    fn provider(&self) -> LlmProvider;

    fn model(&self) -> &str;
}

/// Backend that replays queued completions and records requests.
///
/// Fails with [`LlmError::Exhausted`] once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a completion.
    #[must_use]
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.enqueue(Ok(content.into()));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn fail(self, error: LlmError) -> Self {
        self.enqueue(Err(error));
        self
    }

    fn enqueue(&self, response: Result<String, LlmError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let content = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Err(LlmError::Exhausted))?;
        Ok(LlmResponse {
            content,
            usage: TokenUsage::default(),
            model: self.model().to_string(),
        })
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Scripted
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
