//! LLM manager for provider calls and the HTTP client.
//!
//! The manager is intentionally simple: it holds the HTTP client, the current
//! model settings and the key executor. Which key a call uses, and what
//! happens when a key runs out of quota, is decided by the executor, not here.
//!
//! Settings are hot-reloadable via ArcSwap. `reload_config()` swaps them in
//! and all subsequent calls read the new values lock-free.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::keys::{KeyExecutor, Provider};
use crate::llm::gemini::{self, ChatMessage, GenerateContentRequest};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use futures::stream::BoxStream;
use std::sync::Arc;

const EMPTY_RESPONSE: &str = "No response generated.";

/// Issues provider calls through the rotating key executor.
pub struct LlmManager {
    config: ArcSwap<LlmConfig>,
    http_client: reqwest::Client,
    executor: Arc<KeyExecutor>,
}

impl LlmManager {
    /// Create a new LLM manager with the given configuration.
    pub async fn new(config: LlmConfig, executor: Arc<KeyExecutor>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            http_client,
            executor,
        })
    }

    /// Atomically swap in new model settings.
    pub fn reload_config(&self, config: LlmConfig) {
        self.config.store(Arc::new(config));
        tracing::info!("LLM settings reloaded");
    }

    pub fn executor(&self) -> &Arc<KeyExecutor> {
        &self.executor
    }

    /// Get the HTTP client.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Resolve a model name to provider and model components.
    /// Format: "provider/model-name" or just "model-name" (defaults to Google).
    pub fn resolve_model(&self, model_name: &str) -> Result<(Provider, String)> {
        if let Some((provider, model)) = model_name.split_once('/') {
            let provider = provider
                .parse()
                .map_err(|_| LlmError::UnknownProvider(provider.to_string()))?;
            Ok((provider, model.to_string()))
        } else {
            Ok((Provider::Google, model_name.into()))
        }
    }

    fn target(&self) -> Result<(Arc<LlmConfig>, String)> {
        let config = self.config.load_full();
        let (provider, model) = self.resolve_model(&config.model)?;
        if provider != Provider::Google {
            return Err(LlmError::UnsupportedProvider(provider).into());
        }
        Ok((config, model))
    }

    /// Single-shot text generation.
    pub async fn generate_text(&self, prompt: &str, system_instruction: Option<&str>) -> Result<String> {
        self.generate_chat(&[], prompt, system_instruction).await
    }

    /// Single-shot generation continuing a conversation.
    pub async fn generate_chat(
        &self,
        history: &[ChatMessage],
        message: &str,
        system_instruction: Option<&str>,
    ) -> Result<String> {
        let (config, model) = self.target()?;
        let request = gemini::completion_request(history, message, system_instruction);
        let client = &self.http_client;

        let text = self
            .executor
            .execute_with_rotation(Provider::Google, |secret| {
                let (config, model, request) = (&config, &model, request.clone());
                async move {
                    gemini::generate_content(client, &config.gemini_base_url, model, &secret, request).await
                }
            })
            .await?;

        if text.is_empty() {
            return Ok(EMPTY_RESPONSE.to_string());
        }
        Ok(text)
    }

    /// Token-by-token generation. Key rotation only happens before the first
    /// chunk arrives.
    pub async fn generate_text_stream(
        &self,
        prompt: &str,
        system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, std::result::Result<String, LlmError>>> {
        self.generate_chat_stream(&[], prompt, system_instruction).await
    }

    /// Streaming reply to `message` after the prior `history` turns.
    pub async fn generate_chat_stream(
        &self,
        history: &[ChatMessage],
        message: &str,
        system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, std::result::Result<String, LlmError>>> {
        let (config, model) = self.target()?;
        let request = GenerateContentRequest::chat(history, message, system_instruction);
        let client = &self.http_client;

        let stream = self
            .executor
            .execute_stream_with_rotation(Provider::Google, |secret| {
                let (config, model, request) = (&config, &model, &request);
                async move {
                    gemini::stream_generate_content(client, &config.gemini_base_url, model, &secret, request)
                        .await
                }
            })
            .await?;
        Ok(stream)
    }
}
