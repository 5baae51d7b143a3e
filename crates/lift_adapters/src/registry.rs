//! Resort id → adapter lookup, built once from static config.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::{AdapterSpec, ResortConfig};
use common::{Error, LiftStatusSnapshot, Result};
use tokio::time::Instant;
use tracing::info;

use crate::{FixtureAdapter, JsonFeedAdapter, LiftStatusAdapter};

/// The closed set of built-in adapter variants.
#[derive(Debug, Clone)]
pub enum AdapterKind {
    JsonFeed(JsonFeedAdapter),
    Fixture(FixtureAdapter),
}

#[async_trait]
impl LiftStatusAdapter for AdapterKind {
    async fn fetch(&self, deadline: Instant) -> Result<LiftStatusSnapshot> {
        match self {
            Self::JsonFeed(a) => a.fetch(deadline).await,
            Self::Fixture(a) => a.fetch(deadline).await,
        }
    }

    fn source_url(&self) -> &str {
        match self {
            Self::JsonFeed(a) => a.source_url(),
            Self::Fixture(a) => a.source_url(),
        }
    }
}

/// Maps resort ids to their lift-status adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn LiftStatusAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured resort.
    ///
    /// Resorts without an adapter are simply absent. An adapter entry that cannot be
    /// turned into an adapter is a configuration error.
    pub fn from_resorts(resorts: &[ResortConfig]) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("resort-board/0.1 (lift status aggregator)")
            .pool_max_idle_per_host(2)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build adapter HTTP client: {e}")))?;

        let mut registry = Self::new();
        let mut issues: Vec<String> = Vec::new();

        for resort in resorts {
            let kind = match &resort.adapter {
                AdapterSpec::None => continue,
                AdapterSpec::JsonFeed { url } => {
                    JsonFeedAdapter::new(client.clone(), &resort.id, url).map(AdapterKind::JsonFeed)
                }
                AdapterSpec::Fixture { path } => {
                    FixtureAdapter::new(&resort.id, path).map(AdapterKind::Fixture)
                }
            };
            match kind {
                Ok(adapter) => registry.register(&resort.id, Arc::new(adapter)),
                Err(e) => issues.push(e.to_string()),
            }
        }

        if !issues.is_empty() {
            return Err(Error::Config(format!(
                "Invalid adapters:\n - {}",
                issues.join("\n - ")
            )));
        }

        info!(
            "Adapter registry: {} of {} resorts have a lift adapter",
            registry.len(),
            resorts.len()
        );
        Ok(registry)
    }

    /// Register (or replace) the adapter for a resort.
    pub fn register(&mut self, resort_id: &str, adapter: Arc<dyn LiftStatusAdapter>) {
        self.adapters.insert(resort_id.to_string(), adapter);
    }

    pub fn get(&self, resort_id: &str) -> Option<Arc<dyn LiftStatusAdapter>> {
        self.adapters.get(resort_id).cloned()
    }

    pub fn contains(&self, resort_id: &str) -> bool {
        self.adapters.contains_key(resort_id)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
