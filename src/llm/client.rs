//! Chat-completions client seam
//!
//! The extractor talks to the model through `LlmClient` so tests can
//! script responses without a server. The production implementation is
//! the supervisor itself, which refuses requests unless it is ready.

use super::{LlmState, LlmSupervisor};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Whether a completion call is worth attempting right now.
    async fn is_ready(&self) -> bool;

    /// One chat-completions round trip; returns the assistant text.
    async fn chat(&self, messages: &[ChatMessage], params: ChatParams) -> Result<String>;
}

#[async_trait]
impl LlmClient for LlmSupervisor {
    async fn is_ready(&self) -> bool {
        self.state().await == LlmState::Ready
    }

    async fn chat(&self, messages: &[ChatMessage], params: ChatParams) -> Result<String> {
        if self.state().await != LlmState::Ready {
            return Err(anyhow!("LLM server is not ready"));
        }

        let url = format!("{}/v1/chat/completions", self.base_url());
        let body = CompletionRequest {
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let response = self
            .http()
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("LLM transport error: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM server answered {}", response.status()));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("LLM response parse error: {}", e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("LLM response contained no choices"))
    }
}

/// Scripted client for tests: pops canned responses in order and records
/// every prompt it was given.
#[cfg(test)]
pub struct FakeLlmClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
    pub prompts: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    ready: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FakeLlmClient {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            prompts: std::sync::Mutex::new(Vec::new()),
            ready: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn unavailable() -> Self {
        let fake = Self::new(Vec::new());
        fake.ready
            .store(false, std::sync::atomic::Ordering::Relaxed);
        fake
    }
}

#[cfg(test)]
#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn chat(&self, messages: &[ChatMessage], _params: ChatParams) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(messages.to_vec());
        let next = self
            .responses
            .lock()
            .expect("response script poisoned")
            .pop_front()
            .ok_or_else(|| anyhow!("fake LLM ran out of scripted responses"))?;
        next.map_err(|e| anyhow!(e))
    }
}
