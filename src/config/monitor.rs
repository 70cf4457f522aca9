//! Directory-backed configuration monitor
//!
//! Periodically walks a directory of YAML documents, parses them into
//! configuration objects, and reconciles the result against a
//! [`MemoryController`]. Deletion of a file is observed as the disappearance
//! of its objects on the next walk; there is no per-file bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::memory::MemoryController;
use super::{collections, ConfigEntry};
use crate::lifecycle::ShutdownSignal;

/// Cadence of the directory walk.
pub const WALK_INTERVAL: Duration = Duration::from_millis(100);

/// Walks a directory on an interval and feeds the diff into a store.
pub struct FileMonitor {
    root: PathBuf,
    recursive: bool,
    interval: Duration,
    controller: Arc<MemoryController>,
}

impl FileMonitor {
    /// Create a monitor over `root` feeding `controller`. Only files directly
    /// under the root are read.
    pub fn new(root: impl Into<PathBuf>, controller: Arc<MemoryController>) -> Self {
        Self {
            root: root.into(),
            recursive: false,
            interval: WALK_INTERVAL,
            controller,
        }
    }

    /// Also descend into subdirectories.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Walk the directory and reconcile every collection. The controller is
    /// marked synced after the first complete walk.
    pub fn sync_once(&self) {
        let mut by_kind: HashMap<&'static str, Vec<ConfigEntry>> =
            collections::all().iter().map(|k| (*k, Vec::new())).collect();

        for entry in read_config_files(&self.root, self.recursive) {
            if let Some(bucket) = by_kind.get_mut(entry.kind.as_str()) {
                bucket.push(entry);
            }
        }

        for (kind, desired) in by_kind {
            if self.controller.apply_snapshot(kind, desired) {
                debug!(%kind, "configuration directory changed");
            }
        }
        self.controller.mark_synced();
    }

    /// Drive the walk loop until shutdown.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        loop {
            self.sync_once();
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// On-disk document shape. Identical to [`ConfigEntry`] minus the
/// store-assigned fields.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDocument {
    kind: String,
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    spec: serde_json::Value,
}

/// Parse every YAML file in the directory into configuration objects.
/// Malformed files and unknown kinds are logged and skipped, never fatal.
pub fn read_config_files(root: &Path, recursive: bool) -> Vec<ConfigEntry> {
    let mut out = Vec::new();
    let Ok(dir) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "config directory unreadable");
        return out;
    };

    for dent in dir.flatten() {
        let path = dent.path();
        if path.is_dir() {
            if recursive {
                out.extend(read_config_files(&path, recursive));
            }
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config file");
                continue;
            }
        };
        out.extend(parse_documents(&path.display().to_string(), &content));
    }
    out
}

/// Parse a multi-document YAML stream of configuration objects. `origin`
/// names the source in diagnostics. Shared with every store that ingests
/// YAML documents (directories, ConfigMaps).
pub fn parse_documents(origin: &str, content: &str) -> Vec<ConfigEntry> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(content) {
        let parsed = match FileDocument::deserialize(doc) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%origin, error = %e, "skipping malformed config document");
                continue;
            }
        };
        if !collections::is_known(&parsed.kind) {
            warn!(%origin, kind = %parsed.kind, "skipping unknown config kind");
            continue;
        }
        if parsed.name.is_empty() {
            warn!(%origin, "skipping config document without a name");
            continue;
        }
        let namespace = if parsed.namespace.is_empty() {
            "default".to_string()
        } else {
            parsed.namespace
        };
        out.push(ConfigEntry {
            kind: parsed.kind,
            name: parsed.name,
            namespace,
            spec: parsed.spec,
            ..Default::default()
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::config::ConfigStoreCache;

    const ROUTE_DOC: &str = "kind: routes\nname: web\nnamespace: prod\nspec:\n  hosts: [web.example.com]\n";

    #[test]
    fn parses_multi_document_files() {
        let dir = tempfile::tempdir().unwrap();
        let multi = format!("{ROUTE_DOC}---\nkind: gateways\nname: edge\nspec:\n  port: 443\n");
        std::fs::write(dir.path().join("config.yaml"), multi).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();

        let entries = read_config_files(dir.path(), false);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].namespace, "prod");
        assert_eq!(entries[1].namespace, "default");
    }

    #[test]
    fn skips_unknown_kind_and_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            "kind: teapots\nname: kettle\n---\n:::not yaml:::\n",
        )
        .unwrap();

        let entries = read_config_files(dir.path(), false);
        assert!(entries.is_empty());
    }

    #[test]
    fn no_recursion_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("nested.yaml"), ROUTE_DOC).unwrap();

        assert!(read_config_files(dir.path(), false).is_empty());
        assert_eq!(read_config_files(dir.path(), true).len(), 1);
    }

    #[tokio::test]
    async fn sync_reconciles_store_and_marks_synced() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("routes.yaml");
        std::fs::write(&file, ROUTE_DOC).unwrap();

        let controller = Arc::new(MemoryController::new());
        let monitor = FileMonitor::new(dir.path(), controller.clone());
        assert!(!controller.has_synced());

        monitor.sync_once();
        assert!(controller.has_synced());
        assert!(controller.get(collections::ROUTES, "web", "prod").is_some());

        // Rewrite with a different body: update observed.
        std::fs::write(
            &file,
            "kind: routes\nname: web\nnamespace: prod\nspec:\n  hosts: [web2.example.com]\n",
        )
        .unwrap();
        monitor.sync_once();
        let got = controller.get(collections::ROUTES, "web", "prod").unwrap();
        assert_eq!(got.spec["hosts"][0], "web2.example.com");

        // Remove the file: delete observed.
        std::fs::remove_file(&file).unwrap();
        monitor.sync_once();
        assert!(controller.get(collections::ROUTES, "web", "prod").is_none());
    }
}
