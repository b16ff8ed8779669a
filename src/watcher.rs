use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that can be hot-reloaded from files in a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Owns the poll watcher and the task dispatching its events.
/// Dropping it, or calling `shutdown()`, stops both.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Watch `dir` for files matching `exts` or `WatchedType::is_relevant`.
    /// With `initial_scan`, existing files are loaded first. With
    /// `enable_retry`, a failing initial load is retried a few times.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        Self::with_interval(dir, watcher_impl, exts, initial_scan, enable_retry, DEFAULT_POLL_INTERVAL).await
    }

    pub async fn with_interval(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
                paths.push(entry?.path());
            }
            paths.sort();
            for path in paths {
                if watcher_impl.is_relevant(&path) || is_valid_extension(&path, exts) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means the watcher is shutting down
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("creating poll watcher")?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        let watched = watcher_impl.clone();
        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(?e, "Watcher error");
                        continue;
                    }
                };
                let relevant = event.paths.into_iter().filter(|p| {
                    watched.is_relevant(p) || exts.iter().any(|e| is_valid_extension(p, &[e.as_str()]))
                });
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => {
                        for path in relevant {
                            // a file can be caught half written; it will show up again
                            if !path.exists() {
                                continue;
                            }
                            if let Err(e) = watched.on_create_or_modify(&path).await {
                                warn!(?path, ?e, "Failed to handle create/modify");
                            }
                        }
                    }
                    EventKind::Remove(_) => {
                        for path in relevant {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        info!("👀 Watching {}", dir.display());
        Ok(DirectoryWatcher {
            dir,
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop dispatching events. After this returns no more callbacks run.
    pub fn shutdown(self) {
        self.dispatch.abort();
        info!("Stopped watching {}", self.dir.display());
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

fn is_valid_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|&e| e == ext))
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
