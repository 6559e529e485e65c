use super::cache::MemoryCache;
use super::cancel::CancelToken;
use super::config::{DaemonSettings, DEFAULT_IDLE_TIMEOUT};
use super::config_cache::ConfigCache;
use super::lock::LockFile;
use super::paths::DaemonPaths;
use super::protocol::{
    read_message, write_message, AdminResponse, Message, MessageId, PromptResponse,
    ToggleSegmentRequest,
};
use super::render::{Coordinator, ResponseSink};
use super::session::{IdleTimer, SessionManager};
use super::watcher::{BinaryWatcher, ConfigWatcher};
use crate::error::{Error, Result};
use crate::logging;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often expired value cache entries are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Longest wait for open connections during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(10);
const ACCEPT_ERROR_SLEEP: Duration = Duration::from_millis(100);

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

struct DaemonState {
    paths: DaemonPaths,
    lock: LockFile,
    sessions: SessionManager,
    cache: Arc<MemoryCache>,
    configs: Arc<ConfigCache>,
    config_watcher: Option<Arc<ConfigWatcher>>,
    binary_watcher: Mutex<Option<BinaryWatcher>>,
    coordinator: Coordinator,
    idle: Arc<IdleTimer>,
    shutdown: CancelToken,
    signalled: Arc<AtomicBool>,
    connections: AtomicUsize,
}

/// The render daemon
///
/// Owns the single-instance lock from construction until [`Daemon::serve`]
/// returns. Every cache and table is created here and shared by handle, so
/// several daemons can coexist in one process on different state directories.
pub struct Daemon {
    state: Arc<DaemonState>,
}

impl Daemon {
    /// Acquire the lock and build every shared service
    ///
    /// Fails with [`Error::AlreadyRunning`] when another live daemon holds
    /// the lock.
    pub fn new(settings: DaemonSettings, paths: DaemonPaths) -> Result<Self> {
        paths.ensure_state_dir()?;
        let lock = LockFile::acquire(&paths.lock)?;

        if let Some(log_file) = &settings.log_file {
            if let Err(e) = logging::enable_file_logging(log_file) {
                warn!("cannot log to {}: {}", log_file.display(), e);
            }
        }

        let cache = Arc::new(MemoryCache::new());
        if let Some(ttl) = settings.cache_ttl() {
            cache.set_default_ttl(ttl);
        }

        let configs = Arc::new(ConfigCache::new());
        let config_watcher = match ConfigWatcher::new(Arc::clone(&configs)) {
            Ok(watcher) => Some(Arc::new(watcher)),
            Err(e) => {
                warn!("config file watching disabled: {}", e);
                None
            }
        };

        let sessions = SessionManager::new();
        let coordinator = Coordinator::new(
            sessions.clone(),
            Arc::clone(&cache),
            Arc::clone(&configs),
            config_watcher.clone(),
            &settings.config,
        );

        // Prototype load warms the config cache and may carry the idle timeout
        let prototype = coordinator.load_config("");
        let idle_timeout = prototype
            .idle_timeout()
            .or(settings.idle_timeout)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        if idle_timeout.is_zero() {
            debug!("idle shutdown disabled");
        }

        let shutdown = CancelToken::new();
        let idle = Arc::new(IdleTimer::new(idle_timeout, sessions.clone(), shutdown.clone()));

        let partitions = Arc::clone(&cache);
        sessions.on_unregister(move |session| {
            // Renders key the value cache by the shell's token when it has one
            partitions.clean_session(&session.pid.to_string());
            if !session.uuid.is_empty() {
                partitions.clean_session(&session.uuid);
            }
        });
        let timer = Arc::clone(&idle);
        sessions.on_empty(move || timer.arm());

        let binary_watcher = if settings.watch_binary {
            watch_own_binary(shutdown.clone())
        } else {
            None
        };

        Ok(Self {
            state: Arc::new(DaemonState {
                paths,
                lock,
                sessions,
                cache,
                configs,
                config_watcher,
                binary_watcher: Mutex::new(binary_watcher),
                coordinator,
                idle,
                shutdown,
                signalled: Arc::new(AtomicBool::new(false)),
                connections: AtomicUsize::new(0),
            }),
        })
    }

    /// Route SIGTERM and SIGINT to a graceful shutdown
    pub fn install_signal_handlers(&self) -> Result<()> {
        let flag = Arc::clone(&self.state.signalled);
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, flag)?;
        Ok(())
    }

    /// Cancelling the returned token stops [`Daemon::serve`]
    pub fn shutdown_handle(&self) -> CancelToken {
        self.state.shutdown.clone()
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.state.paths
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.state.cache
    }

    pub fn configs(&self) -> &Arc<ConfigCache> {
        &self.state.configs
    }

    /// Accept connections until shutdown, then clean up
    ///
    /// Failing to bind the socket is fatal: the lock is released and the
    /// error returned.
    pub fn serve(&self) -> Result<()> {
        let listener = match bind_socket(&self.state.paths.socket) {
            Ok(listener) => listener,
            Err(e) => {
                error!("cannot listen on {}: {}", self.state.paths.socket.display(), e);
                self.close_services();
                self.release_lock();
                return Err(e);
            }
        };
        info!(
            "promptd {} listening on {}",
            env!("CARGO_PKG_VERSION"),
            self.state.paths.socket.display()
        );

        self.spawn_cleanup_loop();
        self.state.idle.arm();

        let result = self.accept_loop(&listener);
        drop(listener);

        info!("shutting down daemon");
        self.shutdown_gracefully();
        result
    }

    fn spawn_cleanup_loop(&self) {
        let cache = Arc::clone(&self.state.cache);
        let shutdown = self.state.shutdown.clone();
        let spawned = thread::Builder::new()
            .name("cache-cleanup".to_string())
            .spawn(move || {
                while !shutdown.wait_timeout(CLEANUP_INTERVAL) {
                    let evicted = cache.evict_expired();
                    if evicted > 0 {
                        debug!("evicted {} expired cache entries", evicted);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("cache cleanup disabled: {}", e);
        }
    }

    fn accept_loop(&self, listener: &UnixListener) -> Result<()> {
        listener.set_nonblocking(true)?;

        while !self.state.shutdown.is_cancelled() {
            if self.state.signalled.load(Ordering::Relaxed) {
                info!("received termination signal");
                self.state.shutdown.cancel();
                break;
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("dropping connection: {}", e);
                        continue;
                    }
                    self.spawn_connection(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_IDLE_SLEEP);
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    thread::sleep(ACCEPT_ERROR_SLEEP);
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let state = Arc::clone(&self.state);
        state.connections.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("connection".to_string())
            .spawn(move || {
                if let Err(e) = handle_connection(&state, stream) {
                    debug!("connection ended with error: {}", e);
                }
                state.connections.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            warn!("cannot serve connection: {}", e);
            self.state.connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn shutdown_gracefully(&self) {
        self.state.shutdown.cancel();

        let start = Instant::now();
        while self.state.connections.load(Ordering::SeqCst) > 0 && start.elapsed() < DRAIN_TIMEOUT {
            thread::sleep(Duration::from_millis(10));
        }
        let open = self.state.connections.load(Ordering::SeqCst);
        if open > 0 {
            warn!("abandoning {} open connection(s)", open);
            self.state.coordinator.in_flight().cancel_all();
        }

        if let Err(e) = fs::remove_file(&self.state.paths.socket) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("cannot remove socket: {}", e);
            }
        }

        self.close_services();
        self.release_lock();
        info!("daemon stopped");
    }

    fn close_services(&self) {
        self.state.idle.disarm();
        if let Some(watcher) = &self.state.config_watcher {
            watcher.close();
        }
        if let Some(watcher) = self.state.binary_watcher.lock().take() {
            watcher.close();
        }
        self.state.sessions.close();
    }

    fn release_lock(&self) {
        if let Err(e) = self.state.lock.release() {
            warn!("cannot release lock {}: {}", self.state.lock.path().display(), e);
        }
    }
}

fn watch_own_binary(shutdown: CancelToken) -> Option<BinaryWatcher> {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!("cannot locate daemon binary: {}", e);
            return None;
        }
    };

    match BinaryWatcher::new(&exe, move || shutdown.cancel()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("binary watching disabled: {}", e);
            None
        }
    }
}

/// Bind the Unix socket, replacing a stale one, with owner-only permissions
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;

    Ok(listener)
}

/// Writes render responses back on the request's connection
struct StreamSink<'a> {
    stream: &'a mut UnixStream,
    message_id: MessageId,
}

impl ResponseSink for StreamSink<'_> {
    fn send(&mut self, response: PromptResponse) -> io::Result<()> {
        write_message(&mut *self.stream, &Message::Response(response), self.message_id)
    }
}

fn handle_connection(state: &DaemonState, mut stream: UnixStream) -> Result<()> {
    let (message, message_id) = match read_message(&mut stream) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let result = match message {
        Message::Render(request) => {
            debug!(
                "render request {} session={} pid={}",
                request.request_id, request.session_id, request.pid
            );
            let transport = watch_transport(&stream);
            let mut sink = StreamSink {
                stream: &mut stream,
                message_id,
            };
            state.coordinator.render(request, &transport, &mut sink)
        }
        Message::ToggleSegment(request) => {
            reply(&mut stream, message_id, toggle_segments(state, &request))
        }
        Message::CacheClear => {
            state.cache.clear_all();
            info!("value cache cleared");
            reply(&mut stream, message_id, AdminResponse::ok())
        }
        Message::CacheSetTtl { days } => {
            reply(&mut stream, message_id, set_cache_ttl(state, days))
        }
        Message::CacheGetTtl => {
            let days = state.cache.default_ttl().as_secs() / SECONDS_PER_DAY;
            let response = AdminResponse {
                days: i32::try_from(days).unwrap_or(i32::MAX),
                ..AdminResponse::ok()
            };
            reply(&mut stream, message_id, response)
        }
        Message::SetLogging { path } => reply(&mut stream, message_id, set_logging(&path)),
        other => {
            warn!("unexpected message from client: {:?}", other);
            reply(
                &mut stream,
                message_id,
                AdminResponse::failure("unexpected message type"),
            )
        }
    };

    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn reply(stream: &mut UnixStream, message_id: MessageId, response: AdminResponse) -> Result<()> {
    write_message(stream, &Message::Ack(response), message_id)?;
    Ok(())
}

/// Token cancelled as soon as the client closes its end
fn watch_transport(stream: &UnixStream) -> CancelToken {
    let token = CancelToken::new();
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("cannot watch connection: {}", e);
            return token;
        }
    };

    let watcher = token.clone();
    let spawned = thread::Builder::new()
        .name("transport".to_string())
        .spawn(move || {
            // Clients send nothing after the request; any read result means gone
            let mut buf = [0u8; 1];
            let _ = reader.read(&mut buf);
            watcher.cancel();
        });
    if let Err(e) = spawned {
        warn!("cannot watch connection: {}", e);
    }
    token
}

fn toggle_segments(state: &DaemonState, request: &ToggleSegmentRequest) -> AdminResponse {
    if request.session_id.is_empty() {
        return AdminResponse::failure("missing session_id");
    }
    let hidden = state
        .cache
        .toggle_segments(&request.session_id, &request.segments);
    debug!("session {} hides {:?}", request.session_id, hidden);
    AdminResponse::ok()
}

fn set_cache_ttl(state: &DaemonState, days: i32) -> AdminResponse {
    let Ok(days) = u64::try_from(days) else {
        return AdminResponse::failure(format!("invalid cache TTL: {} days", days));
    };
    if days == 0 {
        return AdminResponse::failure("cache TTL must be at least one day");
    }
    state
        .cache
        .set_default_ttl(Duration::from_secs(days * SECONDS_PER_DAY));
    info!("default cache TTL set to {} day(s)", days);
    AdminResponse::ok()
}

fn set_logging(path: &str) -> AdminResponse {
    if path.is_empty() {
        logging::disable_file_logging();
        return AdminResponse::ok();
    }
    match logging::enable_file_logging(Path::new(path)) {
        Ok(()) => AdminResponse::ok(),
        Err(e) => AdminResponse::failure(Error::from(e).to_string()),
    }
}
