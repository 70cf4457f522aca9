//! Debounced file-change notifications
//!
//! Raw inotify/kqueue events arrive in bursts: editors truncate, write, and
//! rename; config pushes rewrite several keys back to back. Each registered
//! path gets its own debounce task, so a burst collapses to a single callback
//! and a slow callback on one path never delays notifications for another.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;

/// Quiet period after the last raw event before the callback fires.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Watches files and invokes a callback per path, debounced.
pub struct FileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    registrations: Arc<DashMap<PathBuf, mpsc::UnboundedSender<()>>>,
}

impl FileWatcher {
    /// Create a watcher backed by the platform notification API.
    pub fn new() -> Result<Self> {
        let registrations: Arc<DashMap<PathBuf, mpsc::UnboundedSender<()>>> =
            Arc::new(DashMap::new());
        let regs = registrations.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for path in &event.paths {
                        if let Some(tx) = regs.get(path.as_path()) {
                            let _ = tx.send(());
                        }
                    }
                }
                Err(e) => warn!(error = %e, "file watch error"),
            }
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            registrations,
        })
    }

    /// Register a callback for change events on `path`.
    ///
    /// The path must exist. The callback must return promptly; reload work
    /// that can block belongs on a channel or a spawned task.
    pub fn add(&self, path: impl AsRef<Path>, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        let path = std::fs::canonicalize(path.as_ref())?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.registrations.insert(path.clone(), tx);
        self.watcher
            .lock()
            .expect("watcher lock poisoned")
            .watch(&path, RecursiveMode::NonRecursive)?;

        debug!(path = %path.display(), "watching file");
        spawn_debouncer(rx, Arc::new(callback));
        Ok(())
    }

    /// Route a raw change event for `path` into its debouncer, as if the
    /// platform had reported one. Lets callers force a reload.
    pub fn notify_change(&self, path: impl AsRef<Path>) {
        let path = std::fs::canonicalize(path.as_ref()).unwrap_or_else(|_| path.as_ref().to_path_buf());
        if let Some(tx) = self.registrations.get(path.as_path()) {
            let _ = tx.send(());
        }
    }
}

/// One debounce loop per registered path. Every raw event re-arms the timer;
/// the callback runs once per quiet period.
fn spawn_debouncer(mut rx: mpsc::UnboundedReceiver<()>, callback: Callback) {
    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            let armed = deadline;
            let timer = async move {
                match armed {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = timer => {
                    deadline = None;
                    callback();
                }
                event = rx.recv() => match event {
                    Some(()) => deadline = Some(Instant::now() + DEBOUNCE_DELAY),
                    None => break,
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = count.clone();
        (count, move || {
            cb_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_single_callback() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mesh.yaml");
        std::fs::write(&file, "checkServer: m1:9091\n").unwrap();

        let watcher = FileWatcher::new().unwrap();
        let (count, cb) = counted();
        watcher.add(&file, cb).unwrap();

        for _ in 0..5 {
            watcher.notify_change(&file);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_fire_separately() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("networks.yaml");
        std::fs::write(&file, "networks: {}\n").unwrap();

        let watcher = FileWatcher::new().unwrap();
        let (count, cb) = counted();
        watcher.add(&file, cb).unwrap();

        watcher.notify_change(&file);
        tokio::time::sleep(Duration::from_millis(200)).await;
        watcher.notify_change(&file);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paths_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = dir.path().join("mesh.yaml");
        let networks = dir.path().join("networks.yaml");
        std::fs::write(&mesh, "a\n").unwrap();
        std::fs::write(&networks, "b\n").unwrap();

        let watcher = FileWatcher::new().unwrap();
        let (mesh_count, mesh_cb) = counted();
        let (networks_count, networks_cb) = counted();
        watcher.add(&mesh, mesh_cb).unwrap();
        watcher.add(&networks, networks_cb).unwrap();

        watcher.notify_change(&mesh);
        watcher.notify_change(&networks);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(mesh_count.load(Ordering::SeqCst), 1);
        assert_eq!(networks_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn real_write_triggers_callback() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mesh.yaml");
        std::fs::write(&file, "checkServer: m1:9091\n").unwrap();

        let watcher = FileWatcher::new().unwrap();
        let (count, cb) = counted();
        watcher.add(&file, cb).unwrap();

        std::fs::write(&file, "checkServer: m2:9091\n").unwrap();

        let fired = async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), fired)
            .await
            .expect("callback not invoked after file write");
    }
}
