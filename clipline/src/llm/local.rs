//! Local Ollama-style provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::provider::{Completion, GenerateOptions, LlmProvider};
use super::LlmError;
use crate::config::LocalProviderConfig;

/// Chat endpoint of a local Ollama server.
pub struct OllamaProvider {
    config: LocalProviderConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.config.host.trim_end_matches('/'))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: self.name().to_string(),
            }
        } else {
            LlmError::Unreachable {
                provider: self.name().to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Completion, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });

        debug!(model = %self.config.model, "dispatching local generation");
        let response = self
            .client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                provider: self.name().to_string(),
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::BadResponse {
            reason: format!("invalid chat response: {e}"),
        })?;

        Ok(Completion {
            text: parsed.message.content,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
        })
    }

    async fn is_available(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let url = format!("{}/api/tags", self.config.host.trim_end_matches('/'));
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_strips_trailing_slash() {
        let provider = OllamaProvider::new(LocalProviderConfig {
            host: "http://localhost:11434/".into(),
            ..LocalProviderConfig::default()
        });
        assert_eq!(provider.chat_url(), "http://localhost:11434/api/chat");
    }
}
