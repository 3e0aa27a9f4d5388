//! Provider registry and model-string routing.
//!
//! Corresponds to spec §4.6 ("Routing") and §6 ("Model identifier
//! grammar"): `<provider>/<model-name>`, with a registry-configured
//! default provider when no slash is present, and a single optional
//! fallback provider for anything a named provider doesn't claim.

use dashmap::DashMap;
use std::sync::Arc;

use super::Provider;
use crate::error::{Result, RuntimeError};

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    fallback: swap_cell::OptionCell<dyn Provider>,
    default_provider_name: DashMap<(), String>,
}

/// A tiny atomically-swappable cell, avoiding a dependency on the
/// `arc_swap` crate for a single optional pointer: a `parking_lot::Mutex`
/// around an `Option<Arc<dyn Provider>>` is simpler and sufficient, since
/// fallback registration happens once at start-up (spec §5: "populated
/// before any run starts; they are not mutated during a run").
mod swap_cell {
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub struct OptionCell<T: ?Sized> {
        inner: Mutex<Option<Arc<T>>>,
    }

    impl<T: ?Sized> OptionCell<T> {
        pub fn empty() -> Self {
            Self { inner: Mutex::new(None) }
        }

        pub fn store(&self, value: Arc<T>) {
            *self.inner.lock() = Some(value);
        }

        pub fn load(&self) -> Option<Arc<T>> {
            self.inner.lock().clone()
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            fallback: swap_cell::OptionCell::empty(),
            default_provider_name: DashMap::new(),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(RuntimeError::DuplicateProvider { name });
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn set_fallback(&self, provider: Arc<dyn Provider>) {
        self.fallback.store(provider);
    }

    /// Set the provider name used when a model string has no `/`.
    pub fn set_default_provider_name(&self, name: impl Into<String>) {
        self.default_provider_name.insert((), name.into());
    }

    /// Resolve a model string to a provider, per spec §4.6/§6.
    ///
    /// Deterministic for a fixed registry and model string (testable
    /// property #9): named-provider-then-fallback, no randomness.
    pub fn route(&self, model: &str) -> Result<Arc<dyn Provider>> {
        let (provider_name, bare_model) = split_model(model, self.default_provider_name.get(&()).map(|e| e.clone()));

        if let Some(provider) = self.providers.get(&provider_name) {
            if provider.claims(&bare_model) {
                return Ok(provider.clone());
            }
        }
        if let Some(fallback) = self.fallback.load() {
            return Ok(fallback);
        }
        Err(RuntimeError::NoProvider { model: model.to_string() })
    }
}

fn split_model(model: &str, default_provider: Option<String>) -> (String, String) {
    match model.split_once('/') {
        Some((provider, rest)) => (provider.to_string(), rest.to_string()),
        None => (
            default_provider.unwrap_or_else(|| "default".to_string()),
            model.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChannelStream, CompletionRequest, CompletionResponse, FinishReason, StreamHandle, TokenUsage};
    use async_trait::async_trait;

    struct Stub {
        name: &'static str,
    }

    #[async_trait]
    impl Provider for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn claims(&self, _model: &str) -> bool {
            true
        }
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, String> {
            Ok(CompletionResponse {
                content: self.name.to_string(),
                tool_calls: vec![],
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
            })
        }
        async fn stream(&self, _request: CompletionRequest) -> std::result::Result<Box<dyn StreamHandle>, String> {
            let (_tx, rx) = ChannelStream::pair(1);
            Ok(Box::new(rx))
        }
    }

    #[test]
    fn routes_by_named_provider_prefix() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(Stub { name: "anthropic" })).unwrap();
        let provider = registry.route("anthropic/claude-4").unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn falls_back_when_named_provider_missing() {
        let registry = ProviderRegistry::new();
        registry.set_fallback(Arc::new(Stub { name: "gateway" }));
        let provider = registry.route("openai/gpt-5").unwrap();
        assert_eq!(provider.name(), "gateway");
    }

    #[test]
    fn errors_with_no_provider_and_no_fallback() {
        let registry = ProviderRegistry::new();
        let err = registry.route("openai/gpt-5").unwrap_err();
        assert!(matches!(err, RuntimeError::NoProvider { .. }));
    }

    #[test]
    fn routing_is_deterministic() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(Stub { name: "anthropic" })).unwrap();
        let a = registry.route("anthropic/claude-4").unwrap();
        let b = registry.route("anthropic/claude-4").unwrap();
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn no_slash_uses_default_provider_name() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(Stub { name: "openai" })).unwrap();
        registry.set_default_provider_name("openai");
        let provider = registry.route("gpt-5").unwrap();
        assert_eq!(provider.name(), "openai");
    }
}
