//! Provider capability interface.

use async_trait::async_trait;

use super::LlmError;

/// Sampling options forwarded to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

/// Raw completion plus token accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The minimal capability the router depends on: one generation method.
///
/// Routing, retry and fallback policy all live in the router; providers only
/// translate a prompt into raw text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Completion, LlmError>;

    /// Cheap liveness probe used for routing decisions.
    async fn is_available(&self) -> bool;
}
