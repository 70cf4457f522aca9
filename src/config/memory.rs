//! In-memory configuration store
//!
//! Backs the `fs://` directory sources and the remote streaming sources: the
//! producer owns the write side (the file monitor or the stream reader), the
//! rest of the control plane reads through [`ConfigStoreCache`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ConfigEntry, ConfigEvent, ConfigStore, ConfigStoreCache, EventHandler};
use crate::lifecycle::ShutdownSignal;

/// Plain map-backed store, one ordered map per collection.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, BTreeMap<String, ConfigEntry>>>,
    version: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn insert(&self, mut entry: ConfigEntry) -> ConfigEntry {
        entry.resource_version = self.next_version();
        let mut entries = self.entries.write().expect("store lock poisoned");
        entries
            .entry(entry.kind.clone())
            .or_default()
            .insert(entry.key(), entry.clone());
        entry
    }

    fn remove(&self, kind: &str, key: &str) -> Option<ConfigEntry> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        entries.get_mut(kind)?.remove(key)
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry> {
        let entries = self.entries.read().expect("store lock poisoned");
        entries.get(kind)?.get(&format!("{namespace}/{name}")).cloned()
    }

    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry> {
        let entries = self.entries.read().expect("store lock poisoned");
        let Some(by_key) = entries.get(kind) else {
            return Vec::new();
        };
        by_key
            .values()
            .filter(|e| namespace.is_none_or(|ns| e.namespace == ns))
            .cloned()
            .collect()
    }
}

/// A [`MemoryStore`] with change notification and sync tracking.
///
/// Producers mutate it through [`apply`] or [`apply_snapshot`]; whichever
/// producer feeds it decides when the initial snapshot is complete and calls
/// [`mark_synced`].
///
/// [`apply`]: MemoryController::apply
/// [`apply_snapshot`]: MemoryController::apply_snapshot
/// [`mark_synced`]: MemoryController::mark_synced
#[derive(Default)]
pub struct MemoryController {
    store: MemoryStore,
    handlers: RwLock<Vec<EventHandler>>,
    synced: AtomicBool,
}

impl MemoryController {
    /// Create an empty controller; unsynced until a producer marks it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the initial snapshot has been observed.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    fn notify(&self, entry: &ConfigEntry, event: ConfigEvent) {
        let handlers = self.handlers.read().expect("handler lock poisoned");
        for handler in handlers.iter() {
            handler(entry, event);
        }
    }

    /// Apply a single change and notify handlers.
    pub fn apply(&self, entry: ConfigEntry, event: ConfigEvent) {
        match event {
            ConfigEvent::Add | ConfigEvent::Update => {
                let stored = self.store.insert(entry);
                self.notify(&stored, event);
            }
            ConfigEvent::Delete => {
                if let Some(removed) = self.store.remove(&entry.kind, &entry.key()) {
                    self.notify(&removed, ConfigEvent::Delete);
                }
            }
        }
    }

    /// Reconcile one collection against a desired state-of-the-world set.
    ///
    /// Emits add/update/delete events for the difference; updates are
    /// detected by structural comparison so producer-side version churn does
    /// not cause spurious events. Returns whether anything changed.
    pub fn apply_snapshot(&self, kind: &str, desired: Vec<ConfigEntry>) -> bool {
        let existing = self.store.list(kind, None);
        let mut existing_by_key: BTreeMap<String, ConfigEntry> =
            existing.into_iter().map(|e| (e.key(), e)).collect();
        let mut changed = false;

        for entry in desired {
            debug_assert_eq!(entry.kind, kind);
            match existing_by_key.remove(&entry.key()) {
                None => {
                    changed = true;
                    self.apply(entry, ConfigEvent::Add);
                }
                Some(current) if !current.structural_eq(&entry) => {
                    changed = true;
                    self.apply(entry, ConfigEvent::Update);
                }
                Some(_) => {}
            }
        }

        for (_, stale) in existing_by_key {
            changed = true;
            self.apply(stale, ConfigEvent::Delete);
        }

        changed
    }
}

impl ConfigStore for MemoryController {
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry> {
        self.store.get(kind, name, namespace)
    }

    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry> {
        self.store.list(kind, namespace)
    }
}

#[async_trait]
impl ConfigStoreCache for MemoryController {
    fn register_event_handler(&self, handler: EventHandler) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        // The producer feeding this store drives all mutation; nothing to do
        // here but hold the store open until shutdown.
        stop.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::collections;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn route(name: &str, host: &str) -> ConfigEntry {
        ConfigEntry {
            kind: collections::ROUTES.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            spec: serde_json::json!({ "hosts": [host] }),
            ..Default::default()
        }
    }

    #[test]
    fn get_and_list_roundtrip() {
        let controller = MemoryController::new();
        controller.apply(route("a", "a.example.com"), ConfigEvent::Add);
        controller.apply(route("b", "b.example.com"), ConfigEvent::Add);

        let got = controller.get(collections::ROUTES, "a", "default").unwrap();
        assert_eq!(got.spec["hosts"][0], "a.example.com");
        assert_eq!(controller.list(collections::ROUTES, None).len(), 2);
        assert_eq!(controller.list(collections::ROUTES, Some("other")).len(), 0);
        assert_eq!(controller.list(collections::GATEWAYS, None).len(), 0);
    }

    #[test]
    fn snapshot_diff_emits_minimal_events() {
        let controller = MemoryController::new();
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        controller.register_event_handler(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        // Initial snapshot: two adds.
        let changed = controller.apply_snapshot(
            collections::ROUTES,
            vec![route("a", "a.example.com"), route("b", "b.example.com")],
        );
        assert!(changed);
        assert_eq!(events.load(Ordering::SeqCst), 2);

        // Identical snapshot: no events.
        let changed = controller.apply_snapshot(
            collections::ROUTES,
            vec![route("a", "a.example.com"), route("b", "b.example.com")],
        );
        assert!(!changed);
        assert_eq!(events.load(Ordering::SeqCst), 2);

        // One update, one delete.
        let changed =
            controller.apply_snapshot(collections::ROUTES, vec![route("a", "a2.example.com")]);
        assert!(changed);
        assert_eq!(events.load(Ordering::SeqCst), 4);
        assert_eq!(controller.list(collections::ROUTES, None).len(), 1);
    }

    #[test]
    fn unsynced_until_marked() {
        let controller = MemoryController::new();
        assert!(!controller.has_synced());
        controller.mark_synced();
        assert!(controller.has_synced());
    }
}
