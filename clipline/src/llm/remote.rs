//! Remote chat-completions provider.
//!
//! Speaks a minimal OpenAI-style JSON shape. The endpoint, model and API
//! key environment variable are all configurable, so any compatible hosted
//! service can back the `remote` side of the routing table.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::provider::{Completion, GenerateOptions, LlmProvider};
use super::LlmError;
use crate::config::RemoteProviderConfig;

pub struct RemoteProvider {
    config: RemoteProviderConfig,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl RemoteProvider {
    pub fn new(config: RemoteProviderConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key,
            client,
        }
    }

    /// Test hook bypassing the environment lookup.
    pub fn with_api_key(config: RemoteProviderConfig, api_key: impl Into<String>) -> Self {
        let mut provider = Self::new(config);
        provider.api_key = Some(api_key.into());
        provider
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

    async fn map_error_status(&self, status: StatusCode, response: reqwest::Response) -> LlmError {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                // Hosted APIs signal exhausted quota through 429 as well;
                // that case must not be retried.
                if body.contains("insufficient_quota") || body.contains("quota") {
                    LlmError::QuotaExceeded
                } else {
                    LlmError::RateLimited { retry_after }
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth {
                provider: self.name().to_string(),
            },
            StatusCode::PAYMENT_REQUIRED => LlmError::QuotaExceeded,
            _ => LlmError::Http {
                provider: self.name().to_string(),
                status: status.as_u16(),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Completion, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::Auth {
            provider: self.name().to_string(),
        })?;

        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        debug!(model = %self.config.model, "dispatching remote generation");
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.map_error_status(status, response).await);
        }

        let parsed: CompletionsResponse =
            response.json().await.map_err(|e| LlmError::BadResponse {
                reason: format!("invalid completions response: {e}"),
            })?;

        let choice = parsed.choices.into_iter().next().ok_or(LlmError::BadResponse {
            reason: "response carried no choices".to_string(),
        })?;

        Ok(Completion {
            text: choice.message.content,
            prompt_tokens: parsed.usage.prompt_tokens,
            completion_tokens: parsed.usage.completion_tokens,
        })
    }

    async fn is_available(&self) -> bool {
        self.config.enabled && self.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_without_key() {
        let provider = RemoteProvider::new(RemoteProviderConfig {
            api_key_env: "CLIPLINE_TEST_KEY_THAT_IS_UNSET".into(),
            ..RemoteProviderConfig::default()
        });
        assert!(!provider.is_available().await);
    }

    #[tokio::test]
    async fn test_generate_without_key_is_auth_error() {
        let provider = RemoteProvider::new(RemoteProviderConfig {
            api_key_env: "CLIPLINE_TEST_KEY_THAT_IS_UNSET".into(),
            ..RemoteProviderConfig::default()
        });
        let err = provider
            .generate("hi", &GenerateOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::Auth { .. }));
    }
}
