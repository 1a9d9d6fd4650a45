//! Language model providers with token streaming.
//!
//! A [`LanguageModel`] turns a composed prompt into a [`TokenStream`]:
//! tokens arrive incrementally over a channel fed by a spawned reader
//! task, so callers can forward them to a client while generation is
//! still running. Request setup failures (bad config, connection refused,
//! non-success status) surface from [`LanguageModel::generate`] itself;
//! anything after the stream starts is delivered in-band as an `Err` item.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::config::LlmConfig;

/// Buffered channel size between the reader task and the consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 32;

/// An incremental stream of generated tokens.
///
/// Ends when the sender side completes or is dropped. An `Err` item means
/// generation failed mid-stream; no further items follow it.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    pub fn new(rx: mpsc::Receiver<Result<String>>) -> Self {
        Self { rx }
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Trait for streaming text-generation providers.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the model identifier (e.g. `"llama3.2"`).
    fn model_name(&self) -> &str;
    /// Start generating a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<TokenStream>;
}

// ============ Disabled provider ============

/// A no-op language model that always returns errors.
pub struct DisabledLlm;

#[async_trait]
impl LanguageModel for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str) -> Result<TokenStream> {
        bail!("LLM provider is disabled")
    }
}

// ============ Ollama provider ============

/// Language model served by a local Ollama instance.
///
/// Calls `POST /api/generate` with `stream: true` and reads the NDJSON
/// response line by line, forwarding each `response` fragment as a token.
pub struct OllamaLlm {
    model: String,
    url: String,
    temperature: f32,
    timeout_secs: u64,
}

impl OllamaLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": { "temperature": self.temperature },
        });

        let response = client
            .post(format!("{}/api/generate", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buf = String::new();

            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("stream error: {}", e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_ollama_line(line) {
                        Ok((token, done)) => {
                            if !token.is_empty() && tx.send(Ok(token)).await.is_err() {
                                return; // consumer gone
                            }
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(rx))
    }
}

/// Parse one NDJSON line of an Ollama generate response.
fn parse_ollama_line(line: &str) -> Result<(String, bool)> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| anyhow::anyhow!("invalid Ollama chunk: {}", e))?;

    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama generation error: {}", err);
    }

    let token = value
        .get("response")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();
    let done = value.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    Ok((token, done))
}

// ============ OpenAI provider ============

/// Language model using the OpenAI chat completions API.
///
/// Calls `POST /v1/chat/completions` with `stream: true` and reads the
/// SSE response, forwarding each `delta.content` fragment as a token.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiLlm {
    model: String,
    temperature: f32,
    timeout_secs: u64,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "stream": true,
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buf = String::new();

            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("stream error: {}", e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    match parse_openai_delta(data) {
                        Ok(Some(token)) => {
                            if tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(rx))
    }
}

/// Parse one SSE data payload of an OpenAI streaming completion.
fn parse_openai_delta(data: &str) -> Result<Option<String>> {
    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|e| anyhow::anyhow!("invalid OpenAI chunk: {}", e))?;

    let content = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|t| t.as_str());

    Ok(content.filter(|t| !t.is_empty()).map(str::to_string))
}

/// Create the appropriate [`LanguageModel`] based on configuration.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAiLlm::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaLlm::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
