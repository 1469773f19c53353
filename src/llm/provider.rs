// src/llm/provider.rs
// Provider adapter trait and two implementations, grounded on the teacher's
// llm/provider/ split (one trait, one adapter struct per vendor, a reqwest
// client wrapped in `generate`). The real wire format here is a minimal
// OpenAI-compatible chat-completions body, matching the spec's "chat-style
// request with roles user/assistant/system" contract (§6).

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::LlmError;
use crate::config::llm::ProviderConfig;
use crate::conversation::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub budget_hint: f64,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Usage,
    pub model: String,
    pub latency_ms: u64,
    pub truncation_reason: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Default streaming implementation: one full response as a single
    /// chunk. Providers with native streaming APIs override this.
    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream, LlmError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(response.text) })))
    }
}

/// OpenAI-compatible HTTP adapter. Serves as both the "primary" and
/// "fallback" provider entries in config, pointed at different base URLs.
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn estimate_cost(&self, usage: &Usage) -> f64 {
        // Flat per-1k-token estimate; exact provider pricing is out of scope
        // for this spec (C5's contract only requires *some* cost accounting).
        const USD_PER_1K_TOKENS: f64 = 0.002;
        ((usage.prompt_tokens + usage.completion_tokens) as f64 / 1000.0) * USD_PER_1K_TOKENS
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            messages.push(json!({"role": role_str(m.role), "content": m.content}));
        }

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(request.deadline)
            .send()
            .await
            .map_err(|e| LlmError::Transient {
                provider: self.config.name.clone(),
                message: e.to_string(),
            })?;

        if response.status().is_server_error() || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::Transient {
                provider: self.config.name.clone(),
                message: format!("status {}", response.status()),
            });
        }
        if !response.status().is_success() {
            return Err(LlmError::Fatal {
                provider: self.config.name.clone(),
                message: format!("status {}", response.status()),
            });
        }

        let payload: CompletionPayload = response.json().await.map_err(|e| LlmError::Transient {
            provider: self.config.name.clone(),
            message: e.to_string(),
        })?;

        let text = payload
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let truncation_reason = payload
            .choices
            .first()
            .and_then(|c| c.finish_reason.clone())
            .filter(|r| r == "length");

        let mut usage = Usage {
            prompt_tokens: payload.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: payload.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            cost: 0.0,
        };
        usage.cost = self.estimate_cost(&usage);

        Ok(LlmResponse {
            text,
            usage,
            model: self.config.model.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            truncation_reason,
        })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

#[derive(Debug, Deserialize)]
struct CompletionPayload {
    choices: Vec<Choice>,
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// A provider that always fails, used to exercise failover paths in tests
/// without a live HTTP dependency.
pub struct FailingProvider {
    pub label: &'static str,
}

#[async_trait]
impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        self.label
    }

    async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(LlmError::Transient {
            provider: self.label.to_string(),
            message: "simulated failure".into(),
        })
    }
}

/// A provider that always succeeds with a canned response, used in tests.
pub struct EchoProvider {
    pub label: &'static str,
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        self.label
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let text = request
            .messages
            .last()
            .map(|m| format!("echo: {}", m.content))
            .unwrap_or_default();
        Ok(LlmResponse {
            text,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
                cost: 0.001,
            },
            model: "echo".into(),
            latency_ms: 1,
            truncation_reason: None,
        })
    }
}
