//! LLM Router
//!
//! Ranks the configured providers and fails over between them. The
//! configured default provider is tried first, then local providers, then
//! the rest in registration order. Every attempt is bounded by a
//! per-provider timeout (longer for local models, which may need to load).

use super::{CompletionRequest, LLMError, LLMProvider};
use crate::config::LLMConfig;
use crate::secrets::SecretManager;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::anthropic::AnthropicProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;

/// LLM Router that tries providers in ranked order
pub struct LLMRouter {
    /// Available LLM providers
    providers: Vec<Box<dyn LLMProvider>>,

    /// LLM configuration
    config: Arc<LLMConfig>,
}

impl LLMRouter {
    /// Create a new LLM router
    pub fn new(providers: Vec<Box<dyn LLMProvider>>, config: Arc<LLMConfig>) -> Self {
        Self { providers, config }
    }

    /// Build the router from configuration.
    ///
    /// Ollama is always registered. Cloud providers are registered only
    /// when their API key resolves; a keychain error is logged and the
    /// provider skipped.
    pub fn from_config(config: Arc<LLMConfig>, secrets: &SecretManager) -> Self {
        let mut providers: Vec<Box<dyn LLMProvider>> =
            vec![Box::new(OllamaProvider::from_config(&config.ollama))];

        match secrets.get_secret("openai_api_key") {
            Ok(Some(key)) => providers.push(Box::new(OpenAIProvider::new(
                config.openai.clone(),
                key,
            ))),
            Ok(None) => tracing::debug!("No OpenAI key configured"),
            Err(e) => tracing::warn!("Skipping OpenAI: {}", e),
        }

        match secrets.get_secret("anthropic_api_key") {
            Ok(Some(key)) => providers.push(Box::new(AnthropicProvider::new(
                config.anthropic.clone(),
                key,
            ))),
            Ok(None) => tracing::debug!("No Anthropic key configured"),
            Err(e) => tracing::warn!("Skipping Anthropic: {}", e),
        }

        Self::new(providers, config)
    }

    /// Providers in the order they will be tried
    pub fn rank_providers(&self) -> Vec<&dyn LLMProvider> {
        let mut providers: Vec<&dyn LLMProvider> =
            self.providers.iter().map(|b| b.as_ref()).collect();

        let default_provider = self.config.default_provider.as_str();
        // Stable sort keeps registration order within a tier
        providers.sort_by_key(|p| {
            if p.name() == default_provider {
                0
            } else if p.is_local() {
                1
            } else {
                2
            }
        });

        providers
    }

    fn timeout_for(&self, provider: &dyn LLMProvider) -> Duration {
        if provider.is_local() {
            Duration::from_secs(self.config.local_timeout_secs)
        } else {
            Duration::from_secs(self.config.cloud_timeout_secs)
        }
    }

    /// Call providers with automatic failover.
    ///
    /// Returns the completion and the name of the provider that produced it.
    pub async fn call(&self, request: &CompletionRequest) -> super::Result<(String, String)> {
        if self.providers.is_empty() {
            return Err(LLMError::ProviderUnavailable(
                "No LLM providers configured".to_string(),
            ));
        }

        for provider in self.rank_providers() {
            let timeout = self.timeout_for(provider);
            tracing::debug!(
                "Attempting provider: {} (timeout: {}s)",
                provider.name(),
                timeout.as_secs()
            );

            match tokio::time::timeout(timeout, provider.generate(request)).await {
                Ok(Ok(response)) => {
                    tracing::info!("Provider {} succeeded", provider.name());
                    return Ok((response, provider.name().to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Provider {} failed: {}", provider.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Provider {} timed out after {}s",
                        provider.name(),
                        timeout.as_secs()
                    );
                }
            }
        }

        tracing::error!("All LLM providers exhausted");
        Err(LLMError::AllProvidersExhausted)
    }

    /// Check the health of all registered providers
    /// Returns a list of (provider_name, is_healthy)
    pub async fn provider_health(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name(), is_healthy));
        }
        results
    }
}

#[async_trait]
impl LLMProvider for LLMRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn is_local(&self) -> bool {
        self.providers.iter().all(|p| p.is_local())
    }

    async fn generate(&self, request: &CompletionRequest) -> super::Result<String> {
        self.call(request).await.map(|(text, _)| text)
    }

    async fn check_health(&self) -> bool {
        for provider in &self.providers {
            if provider.check_health().await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct MockProvider {
        name: String,
        is_local: bool,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl MockProvider {
        fn boxed(name: &str, is_local: bool, behaviour: Behaviour) -> (Box<dyn LLMProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                name: name.to_string(),
                is_local,
                behaviour,
                calls: Arc::clone(&calls),
            };
            (Box::new(provider), calls)
        }
    }

    #[async_trait]
    impl LLMProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_local(&self) -> bool {
            self.is_local
        }

        async fn generate(&self, _request: &CompletionRequest) -> super::super::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Reply(text) => Ok(text.to_string()),
                Behaviour::Fail => Err(LLMError::NetworkError("connection reset".to_string())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
            }
        }
    }

    fn create_test_config(default_provider: &str) -> Arc<LLMConfig> {
        Arc::new(LLMConfig {
            default_provider: default_provider.to_string(),
            local_timeout_secs: 1,
            cloud_timeout_secs: 1,
            ..Default::default()
        })
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("average sales by region")])
    }

    #[test]
    fn test_rank_default_then_local_then_rest() {
        let (openai, _) = MockProvider::boxed("openai", false, Behaviour::Fail);
        let (anthropic, _) = MockProvider::boxed("anthropic", false, Behaviour::Fail);
        let (ollama, _) = MockProvider::boxed("ollama", true, Behaviour::Fail);
        let router = LLMRouter::new(vec![openai, anthropic, ollama], create_test_config("anthropic"));

        let ranked: Vec<&str> = router.rank_providers().iter().map(|p| p.name()).collect();
        assert_eq!(ranked, vec!["anthropic", "ollama", "openai"]);
    }

    #[tokio::test]
    async fn test_fails_over_to_next_provider() {
        let (ollama, ollama_calls) = MockProvider::boxed("ollama", true, Behaviour::Fail);
        let (openai, openai_calls) = MockProvider::boxed("openai", false, Behaviour::Reply("ok"));
        let router = LLMRouter::new(vec![ollama, openai], create_test_config("ollama"));

        let (text, provider) = router.call(&request()).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(provider, "openai");
        assert_eq!(ollama_calls.load(Ordering::SeqCst), 1);
        assert_eq!(openai_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_times_out() {
        let (ollama, _) = MockProvider::boxed("ollama", true, Behaviour::Hang);
        let (openai, _) = MockProvider::boxed("openai", false, Behaviour::Reply("fallback"));
        let router = LLMRouter::new(vec![ollama, openai], create_test_config("ollama"));

        assert_eq!(router.generate(&request()).await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let (ollama, _) = MockProvider::boxed("ollama", true, Behaviour::Fail);
        let router = LLMRouter::new(vec![ollama], create_test_config("ollama"));

        assert!(matches!(
            router.call(&request()).await,
            Err(LLMError::AllProvidersExhausted)
        ));
    }

    #[tokio::test]
    async fn test_no_providers() {
        let router = LLMRouter::new(vec![], create_test_config("ollama"));
        assert!(matches!(
            router.call(&request()).await,
            Err(LLMError::ProviderUnavailable(_))
        ));
    }
}
