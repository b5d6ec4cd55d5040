//! Cloud provider drivers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::resource::{RemoteResource, Scope};
use crate::secrules::{Provider, ProviderCapabilities, RuleDiff, RuleSet};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider io: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no driver registered for {0}")]
    NotRegistered(Provider),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Lists the cloud-side resources of one type in a scope.
#[async_trait]
pub trait ResourceFetcher<F>: Send + Sync {
    async fn fetch_remote_resources(
        &self,
        scope: &Scope,
    ) -> Result<Vec<RemoteResource<F>>, ProviderError>;
}

/// Security group rule access for one provider.
#[async_trait]
pub trait RuleDriver: Send + Sync {
    fn provider(&self) -> Provider;

    fn capabilities(&self) -> ProviderCapabilities {
        self.provider().capabilities()
    }

    async fn fetch_remote_rules(&self, scope: &Scope) -> Result<RuleSet, ProviderError>;

    /// Deletes `diff`'s deletes, then creates its adds.
    async fn apply_rule_changes(&self, scope: &Scope, diff: &RuleDiff)
    -> Result<(), ProviderError>;
}

/// Rule drivers by provider, built once at startup.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<Provider, Arc<dyn RuleDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver, replacing any previous one for the same provider.
    pub fn register(&mut self, driver: Arc<dyn RuleDriver>) -> Option<Arc<dyn RuleDriver>> {
        self.drivers.insert(driver.provider(), driver)
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn RuleDriver>, ProviderError> {
        self.drivers
            .get(&provider)
            .cloned()
            .ok_or(ProviderError::NotRegistered(provider))
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.drivers.keys().copied().collect();
        providers.sort();
        providers
    }
}

/// Fetcher returning a fixed snapshot.
pub struct SnapshotFetcher<F> {
    resources: RwLock<Vec<RemoteResource<F>>>,
    failure: RwLock<Option<String>>,
}

impl<F: Clone + Send + Sync> SnapshotFetcher<F> {
    pub fn new(resources: Vec<RemoteResource<F>>) -> Self {
        Self {
            resources: RwLock::new(resources),
            failure: RwLock::new(None),
        }
    }

    pub async fn set(&self, resources: Vec<RemoteResource<F>>) {
        *self.resources.write().await = resources;
    }

    /// Makes every later fetch fail with `Io`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }
}

#[async_trait]
impl<F: Clone + Send + Sync> ResourceFetcher<F> for SnapshotFetcher<F> {
    async fn fetch_remote_resources(
        &self,
        _scope: &Scope,
    ) -> Result<Vec<RemoteResource<F>>, ProviderError> {
        if let Some(message) = self.failure.read().await.as_ref() {
            return Err(ProviderError::Io(message.clone()));
        }
        Ok(self.resources.read().await.clone())
    }
}

/// Rule driver keeping rules in memory, one set per scope.
pub struct MemoryRuleDriver {
    provider: Provider,
    capabilities: ProviderCapabilities,
    rules: RwLock<HashMap<String, RuleSet>>,
    fail_apply: RwLock<Option<String>>,
}

impl MemoryRuleDriver {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            capabilities: provider.capabilities(),
            rules: RwLock::new(HashMap::new()),
            fail_apply: RwLock::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn set_rules(&self, scope: &Scope, rules: RuleSet) {
        self.rules.write().await.insert(scope.lock_key(), rules);
    }

    pub async fn rules(&self, scope: &Scope) -> RuleSet {
        self.rules
            .read()
            .await
            .get(&scope.lock_key())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn fail_apply(&self, message: impl Into<String>) {
        *self.fail_apply.write().await = Some(message.into());
    }
}

#[async_trait]
impl RuleDriver for MemoryRuleDriver {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn fetch_remote_rules(&self, scope: &Scope) -> Result<RuleSet, ProviderError> {
        Ok(self.rules(scope).await)
    }

    async fn apply_rule_changes(
        &self,
        scope: &Scope,
        diff: &RuleDiff,
    ) -> Result<(), ProviderError> {
        if let Some(message) = self.fail_apply.read().await.as_ref() {
            return Err(ProviderError::Io(message.clone()));
        }
        let mut rules = self.rules.write().await;
        let current = rules.get(&scope.lock_key()).cloned().unwrap_or_default();
        rules.insert(scope.lock_key(), diff.apply_to(&current));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrules::Rule;

    #[test]
    fn test_registry() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryRuleDriver::new(Provider::Azure)));
        registry.register(Arc::new(MemoryRuleDriver::new(Provider::Aliyun)));
        assert!(
            registry
                .register(Arc::new(MemoryRuleDriver::new(Provider::Aliyun)))
                .is_some()
        );

        assert_eq!(registry.providers(), vec![Provider::Aliyun, Provider::Azure]);
        assert!(registry.get(Provider::Azure).unwrap().capabilities().unique_priority);
        assert_eq!(
            registry.get(Provider::Aws).err(),
            Some(ProviderError::NotRegistered(Provider::Aws))
        );
    }

    #[tokio::test]
    async fn test_memory_driver_applies_diff() {
        let scope = Scope::new("secgroup", "sg-1");
        let driver = MemoryRuleDriver::new(Provider::Aliyun);
        let existing: RuleSet = vec!["in:allow tcp 80".parse::<Rule>().unwrap()].into();
        driver.set_rules(&scope, existing.clone()).await;

        let diff = RuleDiff {
            in_dels: existing,
            in_adds: vec!["in:allow tcp 443".parse::<Rule>().unwrap()].into(),
            ..Default::default()
        };
        driver.apply_rule_changes(&scope, &diff).await.unwrap();
        let rules = driver.fetch_remote_rules(&scope).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.as_slice()[0].to_string(), "in:allow tcp 443");
    }

    #[tokio::test]
    async fn test_snapshot_fetcher_failure() {
        let fetcher: SnapshotFetcher<u32> = SnapshotFetcher::new(Vec::new());
        fetcher.fail_with("timeout").await;
        let err = fetcher
            .fetch_remote_resources(&Scope::new("vpc", "v1"))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Io("timeout".into()));
    }
}
