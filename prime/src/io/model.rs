//! Model adapter: turns a prompt plus conversation history into a reply.
//!
//! [`OllamaAdapter`] talks to an Ollama-compatible `/api/chat` endpoint.
//! [`RetryingModel`] wraps any adapter with bounded retries and, once those
//! are exhausted, a synthetic diagnostic reply so the task loop always has
//! something to interpret.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::conversation::ChatMessage;
use crate::io::config::ModelConfig;

/// Everything the model sees for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    /// Earlier turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
}

pub trait ModelAdapter: Send + Sync {
    fn complete(&self, request: &ModelRequest) -> Result<String>;

    /// Cheap reachability probe for status endpoints.
    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Blocking client for an Ollama-compatible chat endpoint.
pub struct OllamaAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaAdapter {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.name.clone(),
            temperature: config.temperature,
        })
    }
}

impl ModelAdapter for OllamaAdapter {
    #[instrument(skip_all, fields(model = %self.model, history = request.history.len()))]
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(request.system.clone()));
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(request.prompt.clone()));

        let body = ChatRequestBody {
            model: &self.model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, "posting chat request");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("post {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("model server returned {status}: {}", text.trim());
        }
        let parsed: ChatResponseBody = response.json().context("parse chat response")?;
        let content = parsed
            .message
            .map(|message| message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            bail!("model returned an empty reply");
        }
        Ok(content)
    }

    fn ping(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .with_context(|| format!("get {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("model server returned {}", response.status()));
        }
        Ok(())
    }
}

/// Retry wrapper with a synthetic fallback reply.
pub struct RetryingModel<M> {
    inner: M,
    max_retries: u32,
    backoff: Duration,
}

impl<M: ModelAdapter> RetryingModel<M> {
    pub fn new(inner: M, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    pub fn from_config(inner: M, config: &ModelConfig) -> Self {
        Self::new(
            inner,
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }
}

impl<M: ModelAdapter> ModelAdapter for RetryingModel<M> {
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match self.inner.complete(request) {
                Ok(reply) => {
                    if attempt > 1 {
                        info!(attempt, "model call succeeded after retry");
                    }
                    return Ok(reply);
                }
                Err(err) => {
                    warn!(attempt, max = self.max_retries, err = %format!("{err:#}"), "model call failed");
                    last_error = Some(err);
                    if attempt < self.max_retries {
                        thread::sleep(self.backoff);
                    }
                }
            }
        }
        let message = last_error
            .map(|err| format!("{err:#}"))
            .unwrap_or_else(|| "unknown error".to_string());
        Ok(fallback_reply(&message))
    }

    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }
}

/// Diagnostic directive used when the model stays unreachable.
pub fn fallback_reply(error: &str) -> String {
    let escaped = error.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ");
    format!(
        "The model server could not be reached. Reporting connectivity details.\n\
         ```python #PY\n\
         print(\"Model connection error: {escaped}\")\n\
         print(\"Check that the model server is running and reachable.\")\n\
         ```"
    )
}
