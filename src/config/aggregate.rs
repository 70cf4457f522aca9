//! Read-through union of configuration caches
//!
//! The config controller can be backed by several sources at once (one per
//! entry in `mesh.configSources`). This aggregate presents them as a single
//! cache: reads consult children in source order, sync requires every child,
//! and change handlers fan out to all of them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use super::{ConfigEntry, ConfigStore, ConfigStoreCache, EventHandler};
use crate::lifecycle::ShutdownSignal;
use crate::{Error, Result};

/// Union of child caches behind the uniform store interface.
pub struct AggregateCache {
    caches: Vec<Arc<dyn ConfigStoreCache>>,
}

impl AggregateCache {
    /// Combine child caches. Child order is significant: reads resolve
    /// collisions by first match.
    pub fn make(caches: Vec<Arc<dyn ConfigStoreCache>>) -> Result<Self> {
        if caches.is_empty() {
            return Err(Error::config("aggregate cache requires at least one child"));
        }
        Ok(Self { caches })
    }

    /// Number of child caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Whether the aggregate has no children. Never true for a constructed
    /// aggregate; present for interface completeness.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl ConfigStore for AggregateCache {
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry> {
        self.caches
            .iter()
            .find_map(|cache| cache.get(kind, name, namespace))
    }

    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry> {
        self.caches
            .iter()
            .flat_map(|cache| cache.list(kind, namespace))
            .collect()
    }
}

#[async_trait]
impl ConfigStoreCache for AggregateCache {
    fn register_event_handler(&self, handler: EventHandler) {
        for cache in &self.caches {
            cache.register_event_handler(handler.clone());
        }
    }

    fn has_synced(&self) -> bool {
        self.caches.iter().all(|cache| cache.has_synced())
    }

    async fn run(&self, stop: ShutdownSignal) {
        join_all(self.caches.iter().map(|cache| cache.run(stop.clone()))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::collections;
    use crate::config::memory::MemoryController;
    use crate::config::ConfigEvent;

    fn entry(name: &str, host: &str) -> ConfigEntry {
        ConfigEntry {
            kind: collections::ROUTES.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            spec: serde_json::json!({ "hosts": [host] }),
            ..Default::default()
        }
    }

    fn two_children() -> (Arc<MemoryController>, Arc<MemoryController>, AggregateCache) {
        let a = Arc::new(MemoryController::new());
        let b = Arc::new(MemoryController::new());
        let aggregate = AggregateCache::make(vec![a.clone(), b.clone()]).unwrap();
        (a, b, aggregate)
    }

    #[test]
    fn empty_aggregate_rejected() {
        assert!(AggregateCache::make(vec![]).is_err());
    }

    #[test]
    fn reads_union_children() {
        let (a, b, aggregate) = two_children();
        a.apply(entry("only-in-a", "a.example.com"), ConfigEvent::Add);
        b.apply(entry("only-in-b", "b.example.com"), ConfigEvent::Add);

        let got = aggregate
            .get(collections::ROUTES, "only-in-a", "default")
            .unwrap();
        assert_eq!(got.spec["hosts"][0], "a.example.com");

        let got = aggregate
            .get(collections::ROUTES, "only-in-b", "default")
            .unwrap();
        assert_eq!(got.spec["hosts"][0], "b.example.com");

        assert_eq!(aggregate.list(collections::ROUTES, None).len(), 2);
    }

    #[test]
    fn collisions_resolve_by_child_order() {
        let (a, b, aggregate) = two_children();
        a.apply(entry("shared", "from-a.example.com"), ConfigEvent::Add);
        b.apply(entry("shared", "from-b.example.com"), ConfigEvent::Add);

        let got = aggregate
            .get(collections::ROUTES, "shared", "default")
            .unwrap();
        assert_eq!(got.spec["hosts"][0], "from-a.example.com");
    }

    #[test]
    fn synced_only_when_every_child_is() {
        let (a, b, aggregate) = two_children();
        assert!(!aggregate.has_synced());

        a.mark_synced();
        assert!(!aggregate.has_synced());

        b.mark_synced();
        assert!(aggregate.has_synced());
    }

    #[test]
    fn handlers_fan_out_to_children() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (a, b, aggregate) = two_children();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        aggregate.register_event_handler(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        a.apply(entry("x", "x.example.com"), ConfigEvent::Add);
        b.apply(entry("y", "y.example.com"), ConfigEvent::Add);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
