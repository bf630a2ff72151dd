//! Provider routing, retry and fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::local::OllamaProvider;
use super::parser::{parse_and_validate, ResponseSchema};
use super::provider::{GenerateOptions, LlmProvider};
use super::rate_limit::RequestRateLimiter;
use super::remote::RemoteProvider;
use super::{LlmError, TaskKind};
use crate::config::{LlmConfig, ProviderKind};
use crate::retry::Backoff;

/// Counter snapshot for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterMetricsSnapshot {
    pub calls: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

/// Routes each task kind to a provider and owns retry/fallback policy.
///
/// Providers stay dumb: one `generate` method. Everything above it (the
/// routing table, the remote token bucket, rate-limit backoff, the strict
/// re-ask after a parse failure, and local-to-remote fallback) lives here.
pub struct LlmRouter {
    config: LlmConfig,
    local: Option<Arc<dyn LlmProvider>>,
    remote: Option<Arc<dyn LlmProvider>>,
    limiter: Mutex<RequestRateLimiter>,
    rate_limit_backoff: Backoff,
    calls: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

impl LlmRouter {
    /// Build the router with the production providers enabled by config.
    pub fn new(config: LlmConfig) -> Self {
        let local: Option<Arc<dyn LlmProvider>> = if config.local.enabled {
            Some(Arc::new(OllamaProvider::new(config.local.clone())))
        } else {
            None
        };
        let remote: Option<Arc<dyn LlmProvider>> = if config.remote.enabled {
            Some(Arc::new(RemoteProvider::new(config.remote.clone())))
        } else {
            None
        };
        Self::with_providers(config, local, remote)
    }

    /// Wire explicit providers (used by tests with in-process fakes).
    pub fn with_providers(
        config: LlmConfig,
        local: Option<Arc<dyn LlmProvider>>,
        remote: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let rate_limit_backoff = Backoff::with_attempts(config.remote.max_retries);
        let limiter = Mutex::new(RequestRateLimiter::new(config.rpm));
        Self {
            config,
            local,
            remote,
            limiter,
            rate_limit_backoff,
            calls: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Execute one routed task and return its validated JSON result.
    pub async fn execute(
        &self,
        task: TaskKind,
        prompt: &str,
        schema: ResponseSchema,
        cancel: &CancellationToken,
    ) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let primary = self.effective_primary(task);
        debug!(task = %task, provider = %primary, "routing task");

        match self.call_with_budget(primary, prompt, schema, cancel).await {
            Ok(value) => Ok(value),
            Err(e)
                if primary == ProviderKind::Local
                    && self.config.fallback_enabled
                    && self.remote.is_some()
                    && e.is_fallback_eligible() =>
            {
                warn!(task = %task, error = %e, "local provider failed, falling back to remote");
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                let strict = strict_prompt(prompt);
                self.call_with_budget(ProviderKind::Remote, &strict, schema, cancel)
                    .await
                    .inspect_err(|_| {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                    })
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Routed provider for a task, adjusted for enablement.
    fn effective_primary(&self, task: TaskKind) -> ProviderKind {
        let routed = self.config.routing.provider_for(task);
        match routed {
            ProviderKind::Local if self.local.is_none() && self.remote.is_some() => {
                ProviderKind::Remote
            }
            ProviderKind::Remote if self.remote.is_none() && self.local.is_some() => {
                ProviderKind::Local
            }
            other => other,
        }
    }

    /// One provider call, retried through the rate-limit backoff budget.
    async fn call_with_budget(
        &self,
        which: ProviderKind,
        prompt: &str,
        schema: ResponseSchema,
        cancel: &CancellationToken,
    ) -> Result<Value, LlmError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            match self.call_once(which, prompt, schema).await {
                Err(LlmError::RateLimited { retry_after })
                    if which == ProviderKind::Remote
                        && self.rate_limit_backoff.allows(attempt) =>
                {
                    let backoff = self.rate_limit_backoff.delay(attempt);
                    let delay = retry_after.map_or(backoff, |ra| ra.max(backoff));
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "remote rate limited, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// A single call with one strict-mode re-ask after a parse or schema
    /// failure.
    async fn call_once(
        &self,
        which: ProviderKind,
        prompt: &str,
        schema: ResponseSchema,
    ) -> Result<Value, LlmError> {
        let completion = self.generate_on(which, prompt).await?;
        match parse_and_validate(&completion.text, schema) {
            Ok(value) => Ok(value),
            Err(e @ (LlmError::ParseFailure { .. } | LlmError::SchemaFailure { .. })) => {
                debug!(provider = %which, error = %e, "retrying in strict mode");
                let strict = strict_prompt(prompt);
                let completion = self.generate_on(which, &strict).await?;
                parse_and_validate(&completion.text, schema)
            }
            Err(e) => Err(e),
        }
    }

    async fn generate_on(
        &self,
        which: ProviderKind,
        prompt: &str,
    ) -> Result<super::Completion, LlmError> {
        let provider = match which {
            ProviderKind::Local => self.local.as_ref().ok_or(LlmError::NoProvider("local"))?,
            ProviderKind::Remote => self.remote.as_ref().ok_or(LlmError::NoProvider("remote"))?,
        };

        if which == ProviderKind::Remote {
            self.limiter.lock().await.acquire().await;
        }

        let options = GenerateOptions {
            system_prompt: None,
            temperature: self.config.temperature,
            max_tokens: self.config.max_output_tokens,
        };
        provider.generate(prompt, &options).await
    }
}

/// Augment a prompt to demand strict schema adherence.
fn strict_prompt(prompt: &str) -> String {
    format!(
        "{prompt}\n\nReturn ONLY valid JSON matching the requested structure exactly. \
         No explanations, no code fences, no extra keys."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted fake: a queue of responses, popped per call.
    struct FakeProvider {
        name: &'static str,
        responses: Mutex<Vec<Result<String, LlmError>>>,
        call_count: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &'static str, responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<super::super::Completion, LlmError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            let next = if responses.is_empty() {
                Ok("[]".to_string())
            } else {
                responses.remove(0)
            };
            next.map(|text| super::super::Completion {
                text,
                prompt_tokens: 1,
                completion_tokens: 1,
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn config() -> LlmConfig {
        LlmConfig {
            rpm: 6000,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_failure_falls_back_to_remote() {
        let local = FakeProvider::new(
            "local",
            vec![Err(LlmError::Unreachable {
                provider: "local".into(),
                reason: "connection refused".into(),
            })],
        );
        let remote = FakeProvider::new("remote", vec![Ok(r#"["Title A"]"#.to_string())]);

        let router = LlmRouter::with_providers(
            config(),
            Some(local.clone() as Arc<dyn LlmProvider>),
            Some(remote.clone() as Arc<dyn LlmProvider>),
        );

        let cancel = CancellationToken::new();
        let value = router
            .execute(
                TaskKind::HighlightDetection,
                "find highlights",
                ResponseSchema::TitleArray,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(value[0], "Title A");
        assert_eq!(local.calls(), 1);
        assert_eq!(remote.calls(), 1);
        assert_eq!(router.metrics().fallbacks, 1);
        assert_eq!(router.metrics().failures, 0);
    }

    #[tokio::test]
    async fn test_parse_failure_triggers_strict_retry_then_fallback() {
        let local = FakeProvider::new(
            "local",
            vec![
                Ok("not json at all".to_string()),
                Ok("still not json".to_string()),
            ],
        );
        let remote = FakeProvider::new("remote", vec![Ok("[]".to_string())]);

        let router = LlmRouter::with_providers(
            config(),
            Some(local.clone() as Arc<dyn LlmProvider>),
            Some(remote.clone() as Arc<dyn LlmProvider>),
        );

        let cancel = CancellationToken::new();
        let value = router
            .execute(
                TaskKind::ChapterDetection,
                "chapters please",
                ResponseSchema::ChapterArray,
                &cancel,
            )
            .await
            .unwrap();

        assert!(value.as_array().unwrap().is_empty());
        // Two local attempts (normal + strict), then remote.
        assert_eq!(local.calls(), 2);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded_not_retried() {
        let remote = FakeProvider::new("remote", vec![Err(LlmError::QuotaExceeded)]);
        let mut cfg = config();
        cfg.routing.title_generation = ProviderKind::Remote;

        let router =
            LlmRouter::with_providers(cfg, None, Some(remote.clone() as Arc<dyn LlmProvider>));

        let cancel = CancellationToken::new();
        let err = router
            .execute(
                TaskKind::TitleGeneration,
                "titles",
                ResponseSchema::TitleArray,
                &cancel,
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, LlmError::QuotaExceeded));
        assert_eq!(remote.calls(), 1);
        assert_eq!(router.metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_within_budget() {
        let remote = FakeProvider::new(
            "remote",
            vec![
                Err(LlmError::RateLimited {
                    retry_after: Some(std::time::Duration::from_millis(10)),
                }),
                Ok(r#"{"1": "done"}"#.to_string()),
            ],
        );
        let mut cfg = config();
        cfg.routing.translation = ProviderKind::Remote;
        cfg.remote.max_retries = 2;

        let router =
            LlmRouter::with_providers(cfg, None, Some(remote.clone() as Arc<dyn LlmProvider>));

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let value = router
            .execute(
                TaskKind::Translation,
                "translate",
                ResponseSchema::TranslationMap,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(value["1"], "done");
        assert_eq!(remote.calls(), 2);
        // The first backoff step is at least the policy's initial delay.
        assert!(started.elapsed() >= std::time::Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let local = FakeProvider::new("local", vec![]);
        let router =
            LlmRouter::with_providers(config(), Some(local.clone() as Arc<dyn LlmProvider>), None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .execute(
                TaskKind::HighlightDetection,
                "x",
                ResponseSchema::HighlightArray,
                &cancel,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(local.calls(), 0);
    }
}
