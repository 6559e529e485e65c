//! File system watchers
//!
//! [`ConfigWatcher`] drops cached configurations when any file they were
//! parsed from changes. Editors that save by writing a temp file and renaming
//! it over the original replace the inode, so watches go on parent
//! directories and events are matched by path.
//!
//! [`BinaryWatcher`] notices the daemon executable being replaced so an
//! upgraded binary takes over on the next request.

use super::config_cache::ConfigCache;
use crate::config::is_remote;
use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Quiet period after the last binary change before reacting
pub const BINARY_DEBOUNCE: Duration = Duration::from_secs(1);

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

#[derive(Default)]
struct WatchedFiles {
    /// Watched file path to the cache keys of configs that include it
    files: HashMap<PathBuf, HashSet<String>>,
    dirs: HashSet<PathBuf>,
}

struct ConfigWatchState {
    cache: Arc<ConfigCache>,
    watched: RwLock<WatchedFiles>,
}

impl ConfigWatchState {
    fn handle(&self, event: Event) {
        if !is_change(&event.kind) {
            return;
        }

        let affected: HashSet<String> = {
            let watched = self.watched.read();
            event
                .paths
                .iter()
                .filter_map(|path| watched.files.get(path))
                .flatten()
                .cloned()
                .collect()
        };

        for config_path in affected {
            debug!("config file changed, invalidating {}", config_path);
            self.cache.invalidate(&config_path);
        }
    }
}

/// Invalidates [`ConfigCache`] entries whose files change on disk
pub struct ConfigWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    state: Arc<ConfigWatchState>,
}

impl ConfigWatcher {
    pub fn new(cache: Arc<ConfigCache>) -> Result<Self> {
        let state = Arc::new(ConfigWatchState {
            cache,
            watched: RwLock::new(WatchedFiles::default()),
        });

        let handler_state = Arc::clone(&state);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => handler_state.handle(event),
            Err(e) => warn!("config watcher error: {}", e),
        })?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            state,
        })
    }

    /// Watch every local file `config_path` was built from
    ///
    /// `file_paths` lists the whole `extends` chain. Remote entries are
    /// skipped; they expire by time instead.
    pub fn watch(&self, config_path: &str, file_paths: &[String]) -> Result<()> {
        let mut guard = self.watcher.lock();
        let Some(watcher) = guard.as_mut() else {
            return Ok(());
        };

        for file in file_paths.iter().filter(|p| !is_remote(p)) {
            let path = PathBuf::from(file);

            // A symlinked file changes where its target lives, so both the
            // link and the resolved target get their own directory watch
            let mut targets = vec![path.clone()];
            if let Ok(resolved) = path.canonicalize() {
                if resolved != path {
                    targets.push(resolved);
                }
            }

            for target in targets {
                let Some(dir) = target.parent().map(Path::to_path_buf) else {
                    continue;
                };
                self.watch_dir(watcher, dir)?;

                self.state
                    .watched
                    .write()
                    .files
                    .entry(target)
                    .or_default()
                    .insert(config_path.to_string());
            }
        }

        Ok(())
    }

    fn watch_dir(&self, watcher: &mut RecommendedWatcher, dir: PathBuf) -> Result<()> {
        if self.state.watched.read().dirs.contains(&dir) {
            return Ok(());
        }
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!("watching config directory {}", dir.display());
        self.state.watched.write().dirs.insert(dir);
        Ok(())
    }

    pub fn watched_dir_count(&self) -> usize {
        self.state.watched.read().dirs.len()
    }

    pub fn watched_file_count(&self) -> usize {
        self.state.watched.read().files.len()
    }

    /// Stop watching; later [`ConfigWatcher::watch`] calls do nothing
    pub fn close(&self) {
        if self.watcher.lock().take().is_some() {
            let mut watched = self.state.watched.write();
            watched.files.clear();
            watched.dirs.clear();
        }
    }
}

/// Calls a handler once when the watched executable is replaced
pub struct BinaryWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl BinaryWatcher {
    pub fn new<F>(exe_path: &Path, on_change: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_debounce(exe_path, BINARY_DEBOUNCE, on_change)
    }

    pub fn with_debounce<F>(exe_path: &Path, debounce: Duration, on_change: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let exe_path = exe_path
            .canonicalize()
            .unwrap_or_else(|_| exe_path.to_path_buf());
        let dir = exe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let file_name = exe_path.file_name().map(|name| name.to_os_string());

        let (tx, rx) = mpsc::channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let touches_binary = event
                .paths
                .iter()
                .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
            if touches_binary {
                let _ = tx.send(());
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        thread::Builder::new()
            .name("binary-watcher".to_string())
            .spawn(move || {
                // Closing the watcher drops the sender and ends this thread
                if rx.recv().is_err() {
                    return;
                }
                loop {
                    match rx.recv_timeout(debounce) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                info!("daemon binary changed");
                on_change();
            })?;

        info!("watching daemon binary {}", exe_path.display());
        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn close(&self) {
        self.watcher.lock().take();
    }
}
