use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::sync::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

/// Trait for objects that can be hot-reloaded from disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls one directory and forwards relevant changes to a [`WatchedType`].
/// Dropping it or calling `shutdown()` stops the polling.
pub struct DirectoryWatcher {
    handles: Mutex<Vec<JoinHandle<()>>>,
    // kept alive for as long as we watch
    _watcher: PollWatcher,
}

impl DirectoryWatcher {
    /// Start watching `dir`. With `initial_scan`, every relevant file already
    /// present is reloaded first; with `enable_retry`, failed reloads are
    /// retried a few times.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        // ── 1. reload what is already there ──
        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watcher_impl.is_relevant(&path) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        // ── 2. poll watcher pushing events into a channel ──
        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening any more
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(poll_interval)
                .with_compare_contents(true),
        )
        .context("failed to create PollWatcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        // ── 3. dispatch ──
        let watched = watcher_impl.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            try_reload(&watched, &path, enable_retry).await;
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(?e, "Watcher error");
                    }
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher {
            handles: Mutex::new(vec![dispatch]),
            _watcher: watcher,
        })
    }

    /// Abort the dispatch task. No events are delivered afterwards.
    pub fn shutdown(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct JsonWatcher {
        reloads: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for JsonWatcher {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("json")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_modify_and_remove_are_dispatched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let watched = Arc::new(JsonWatcher { reloads: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let watcher = DirectoryWatcher::new(
            dir.path().to_path_buf(),
            watched.clone(),
            true,
            false,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(watched.reloads.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "{\"addons\": {}}").unwrap();
        assert!(eventually(|| watched.reloads.load(Ordering::SeqCst) >= 2).await);

        std::fs::remove_file(&path).unwrap();
        assert!(eventually(|| watched.removed.load(Ordering::SeqCst) == 1).await);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let watched = Arc::new(JsonWatcher { reloads: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let missing = dir.path().join("nope");
        assert!(DirectoryWatcher::new(missing, watched, false, false, Duration::from_millis(50)).await.is_err());
    }
}
