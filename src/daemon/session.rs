//! Shell session tracking
//!
//! Shells do not reliably tell the daemon when they exit, so every registered
//! session gets a watch thread that blocks on the OS process-exit notification
//! for its pid and unregisters the session when the shell dies.

use super::cancel::CancelToken;
use super::process;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A connected shell process
#[derive(Debug, Clone)]
pub struct Session {
    pub pid: i32,
    /// Token the shell identified itself with, empty when none
    pub uuid: String,
    pub shell: String,
    pub registered_at: Instant,
    watch: CancelToken,
}

type UnregisterHook = Box<dyn Fn(&Session) + Send + Sync>;
type EmptyHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_unregister: Option<UnregisterHook>,
    on_empty: Option<EmptyHook>,
}

struct Inner {
    sessions: Mutex<HashMap<i32, Session>>,
    hooks: Mutex<Hooks>,
}

/// Table of live sessions keyed by pid
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Called with each session after it is removed
    pub fn on_unregister(&self, hook: impl Fn(&Session) + Send + Sync + 'static) {
        self.inner.hooks.lock().on_unregister = Some(Box::new(hook));
    }

    /// Called whenever removing a session leaves the table empty
    pub fn on_empty(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.lock().on_empty = Some(Box::new(hook));
    }

    /// Track `pid` until it exits; registering a known pid does nothing
    pub fn register(&self, pid: i32, uuid: &str, shell: &str) {
        let watch = {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(&pid) {
                return;
            }

            let watch = CancelToken::new();
            sessions.insert(
                pid,
                Session {
                    pid,
                    uuid: uuid.to_string(),
                    shell: shell.to_string(),
                    registered_at: Instant::now(),
                    watch: watch.clone(),
                },
            );
            watch
        };

        info!("session registered: pid={} shell={}", pid, shell);

        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", pid))
            .spawn(move || {
                process::wait_for_exit(pid, &watch);
                if !watch.is_cancelled() {
                    debug!("shell {} exited", pid);
                    manager.unregister(pid);
                }
            });

        if let Err(e) = spawned {
            // Without a watcher the entry would never go away
            warn!("failed to watch session {}: {}", pid, e);
            self.unregister(pid);
        }
    }

    /// Drop the session for `pid`, stopping its watch; unknown pids are ignored
    pub fn unregister(&self, pid: i32) {
        let (removed, now_empty) = {
            let mut sessions = self.inner.sessions.lock();
            let removed = sessions.remove(&pid);
            let now_empty = removed.is_some() && sessions.is_empty();
            (removed, now_empty)
        };

        let Some(session) = removed else {
            return;
        };
        session.watch.cancel();
        info!("session unregistered: pid={}", pid);

        let hooks = self.inner.hooks.lock();
        if let Some(hook) = &hooks.on_unregister {
            hook(&session);
        }
        if now_empty {
            if let Some(hook) = &hooks.on_empty {
                hook();
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.inner.sessions.lock().contains_key(&pid)
    }

    pub fn get(&self, pid: i32) -> Option<Session> {
        self.inner.sessions.lock().get(&pid).cloned()
    }

    /// Stop every watch thread and forget all sessions without firing hooks
    pub fn close(&self) {
        let sessions: Vec<Session> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.watch.cancel();
        }
    }
}

/// Shuts the daemon down after a quiet period with no sessions
///
/// Each [`IdleTimer::arm`] starts a fresh countdown and supersedes the previous
/// one. When a countdown expires the session count is checked again, so a
/// shell that registered in the meantime keeps the daemon alive.
pub struct IdleTimer {
    timeout: Duration,
    sessions: SessionManager,
    shutdown: CancelToken,
    current: Mutex<Option<CancelToken>>,
}

impl IdleTimer {
    /// A zero `timeout` disables idle shutdown
    pub fn new(timeout: Duration, sessions: SessionManager, shutdown: CancelToken) -> Self {
        Self {
            timeout,
            sessions,
            shutdown,
            current: Mutex::new(None),
        }
    }

    pub fn arm(&self) {
        if self.timeout.is_zero() {
            return;
        }

        let countdown = CancelToken::new();
        if let Some(previous) = self.current.lock().replace(countdown.clone()) {
            previous.cancel();
        }

        let timeout = self.timeout;
        let sessions = self.sessions.clone();
        let shutdown = self.shutdown.clone();
        let spawned = thread::Builder::new()
            .name("idle-timer".to_string())
            .spawn(move || {
                if countdown.wait_timeout(timeout) {
                    return;
                }
                if sessions.count() == 0 && !shutdown.is_cancelled() {
                    info!("no sessions for {:?}, shutting down", timeout);
                    shutdown.cancel();
                }
            });

        if let Err(e) = spawned {
            warn!("failed to start idle timer: {}", e);
        }
    }

    /// Cancel any running countdown
    pub fn disarm(&self) {
        if let Some(countdown) = self.current.lock().take() {
            countdown.cancel();
        }
    }
}
