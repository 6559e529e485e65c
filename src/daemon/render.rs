//! Streaming render coordinator
//!
//! A request moves through: version check, session registration, in-flight
//! replacement, config resolution, initial render, then one `update` per
//! background segment until nothing is pending and a `complete` goes out.
//! The last response for a request is always `complete`, unless the request
//! was cancelled, in which case nothing more is sent.

use super::cache::MemoryCache;
use super::cancel::CancelToken;
use super::config_cache::ConfigCache;
use super::protocol::{PromptRequest, PromptResponse, ResponseType, PROTOCOL_VERSION};
use super::session::SessionManager;
use super::text_cache::SessionTextCache;
use super::watcher::ConfigWatcher;
use crate::config::{self, Config};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::render::{Engine, Progress};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Initial render window when the configuration names none
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on waiting for pending segments after the first response
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a streaming request checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Environment variable a shell may set to name its session
pub const SESSION_ENV: &str = "PROMPTD_SESSION_ID";

/// Destination for a request's streamed responses
pub trait ResponseSink {
    fn send(&mut self, response: PromptResponse) -> io::Result<()>;
}

impl ResponseSink for Vec<PromptResponse> {
    fn send(&mut self, response: PromptResponse) -> io::Result<()> {
        self.push(response);
        Ok(())
    }
}

/// Cancel handles of the renders currently running, one per session
#[derive(Default)]
pub struct InFlight {
    renders: Mutex<HashMap<String, (u64, CancelToken)>>,
    generation: AtomicU64,
}

impl InFlight {
    /// Register a new render for `session_id`, cancelling the one it replaces
    pub fn begin(&self, session_id: &str) -> (u64, CancelToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken::new();

        let previous = self
            .renders
            .lock()
            .insert(session_id.to_string(), (generation, token.clone()));
        if let Some((_, previous)) = previous {
            debug!("superseding in-flight render for session {}", session_id);
            previous.cancel();
        }
        (generation, token)
    }

    /// Forget the handle unless a newer render already replaced it
    pub fn finish(&self, session_id: &str, generation: u64) {
        let mut renders = self.renders.lock();
        if renders.get(session_id).is_some_and(|(g, _)| *g == generation) {
            renders.remove(session_id);
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.renders.lock().drain() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.renders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared services a render request draws on
pub struct Coordinator {
    sessions: SessionManager,
    cache: Arc<MemoryCache>,
    configs: Arc<ConfigCache>,
    watcher: Option<Arc<ConfigWatcher>>,
    in_flight: InFlight,
    default_config: String,
    pending_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        sessions: SessionManager,
        cache: Arc<MemoryCache>,
        configs: Arc<ConfigCache>,
        watcher: Option<Arc<ConfigWatcher>>,
        default_config: &str,
    ) -> Self {
        Self {
            sessions,
            cache,
            configs,
            watcher,
            in_flight: InFlight::default(),
            default_config: default_config.to_string(),
            pending_timeout: PENDING_TIMEOUT,
        }
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Serve one render request, streaming responses into `sink`
    ///
    /// `transport` is cancelled when the client goes away. A superseded or
    /// cancelled request returns `Ok` without sending anything further.
    pub fn render(
        &self,
        request: PromptRequest,
        transport: &CancelToken,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        if request.version != PROTOCOL_VERSION {
            warn!(
                "rejecting render request with protocol version {}",
                request.version
            );
            let err = Error::VersionMismatch {
                client: request.version,
                server: PROTOCOL_VERSION,
            };
            sink.send(PromptResponse::failure(&request.request_id, err.to_string()))?;
            return Err(err);
        }

        if request.pid > 0 {
            let uuid = request.env.get(SESSION_ENV).map(String::as_str).unwrap_or("");
            self.sessions.register(request.pid, uuid, &request.flags.shell);
        }

        let session_id = if request.session_id.is_empty() {
            request.pid.to_string()
        } else {
            request.session_id.clone()
        };

        let (generation, token) = self.in_flight.begin(&session_id);
        let result = self.stream(&session_id, request, &token, transport, sink);
        self.in_flight.finish(&session_id, generation);
        result
    }

    fn stream(
        &self,
        session_id: &str,
        request: PromptRequest,
        token: &CancelToken,
        transport: &CancelToken,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let started = Instant::now();
        let request_id = request.request_id;
        let cancelled = || token.is_cancelled() || transport.is_cancelled();

        let config = self.load_config(&request.flags.config_path);
        let timeout = config.async_timeout().unwrap_or(DEFAULT_ASYNC_TIMEOUT);

        let text_cache = SessionTextCache::new(Arc::clone(&self.cache), session_id, &request.flags.pwd);
        let hidden: HashSet<String> = self.cache.toggles(session_id).into_iter().collect();
        let env = Environment::new(request.flags, request.env);
        let mut engine = Engine::new(config, env, Arc::new(text_cache)).with_hidden(hidden);

        let pending = engine.render_streaming(timeout);
        if cancelled() {
            debug!("render {} cancelled before first response", request_id);
            return Ok(());
        }

        let kind = if pending > 0 {
            ResponseType::Update
        } else {
            ResponseType::Complete
        };
        sink.send(PromptResponse::new(kind, &request_id, engine.prompts()))?;
        if kind == ResponseType::Complete {
            debug!("render {} complete in {:?}", request_id, started.elapsed());
            return Ok(());
        }

        let deadline = Instant::now() + self.pending_timeout;
        loop {
            if cancelled() {
                debug!("render {} cancelled with {} pending", request_id, engine.pending_count());
                return Ok(());
            }

            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                warn!(
                    "render {} gave up on {} pending segment(s)",
                    request_id,
                    engine.pending_count()
                );
                break;
            }

            match engine.next_completion(wait.min(CANCEL_POLL)) {
                Progress::Idle => continue,
                Progress::Exhausted => break,
                Progress::Segment(name) => {
                    if cancelled() {
                        return Ok(());
                    }
                    debug!("segment {} resolved for render {}", name, request_id);
                    if engine.pending_count() == 0 {
                        break;
                    }
                    sink.send(PromptResponse::new(
                        ResponseType::Update,
                        &request_id,
                        engine.prompts(),
                    ))?;
                }
            }
        }

        if cancelled() {
            return Ok(());
        }
        sink.send(PromptResponse::new(
            ResponseType::Complete,
            &request_id,
            engine.prompts(),
        ))?;
        debug!("render {} complete in {:?}", request_id, started.elapsed());
        Ok(())
    }

    /// Per-request copy of the configuration at `path`
    ///
    /// An empty `path` means the daemon's default configuration.
    pub fn load_config(&self, path: &str) -> Config {
        let path = if path.is_empty() {
            self.default_config.as_str()
        } else {
            path
        };

        if let Some(cached) = self.configs.get(path) {
            debug!("config cache hit: {:?}", path);
            return cached.config.clone();
        }

        debug!("config cache miss: {:?}", path);
        let config = config::load(path);
        if config.source != path {
            // Fell back to the default; caching it under `path` would stick
            return config;
        }

        let file_paths = config.file_paths.clone();
        let cached = self.configs.set(path, config, file_paths);
        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.watch(path, &cached.file_paths) {
                warn!("cannot watch config {}: {}", path, e);
            }
        }
        info!("loaded config {:?} ({} file(s))", path, cached.file_paths.len());
        cached.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::RenderFlags;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    fn coordinator(default_config: &str) -> Coordinator {
        Coordinator::new(
            SessionManager::new(),
            Arc::new(MemoryCache::new()),
            Arc::new(ConfigCache::new()),
            None,
            default_config,
        )
    }

    fn request(config_path: &str, session: &str) -> PromptRequest {
        PromptRequest {
            version: PROTOCOL_VERSION,
            session_id: session.to_string(),
            request_id: format!("req-{}", session),
            pid: 0,
            env: HashMap::new(),
            flags: RenderFlags {
                config_path: config_path.to_string(),
                plain: true,
                ..Default::default()
            },
        }
    }

    fn write_config(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_fast_config_single_complete() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "fast.json",
            r#"{"blocks":[{"segments":[{"type":"text","properties":{"text":"hi"}}]}]}"#,
        );
        let coordinator = coordinator("");
        let mut sink = Vec::new();

        coordinator
            .render(request(&path, "s"), &CancelToken::new(), &mut sink)
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].kind, ResponseType::Complete);
        assert_eq!(sink[0].prompt("primary"), "hi");
        assert_eq!(sink[0].request_id, "req-s");
        assert!(coordinator.in_flight().is_empty());
    }

    #[test]
    fn test_slow_segment_streams_update_then_complete() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "slow.json",
            r#"{"async_timeout": 50, "blocks":[{"segments":[
                {"type":"text","properties":{"text":"fast"}},
                {"type":"command","properties":{"command":"sleep 0.3; echo slow"}}
            ]}]}"#,
        );
        let coordinator = coordinator("");
        let mut sink = Vec::new();

        coordinator
            .render(request(&path, "s"), &CancelToken::new(), &mut sink)
            .unwrap();

        assert_eq!(sink.first().unwrap().kind, ResponseType::Update);
        assert_eq!(sink.first().unwrap().prompt("primary"), "fast");
        let last = sink.last().unwrap();
        assert_eq!(last.kind, ResponseType::Complete);
        assert_eq!(last.prompt("primary"), "fast slow");
        assert_eq!(
            sink.iter().filter(|r| r.kind == ResponseType::Complete).count(),
            1
        );
    }

    #[test]
    fn test_version_mismatch() {
        let coordinator = coordinator("");
        let mut req = request("", "s");
        req.version = PROTOCOL_VERSION + 1;
        let mut sink = Vec::new();

        let err = coordinator
            .render(req, &CancelToken::new(), &mut sink)
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].kind, ResponseType::Complete);
        assert!(!sink[0].error.is_empty());
    }

    #[test]
    fn test_supersede_cancels_previous() {
        let in_flight = InFlight::default();
        let (first_gen, first) = in_flight.begin("x");
        let (second_gen, second) = in_flight.begin("x");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // A stale finish must not drop the newer handle
        in_flight.finish("x", first_gen);
        assert_eq!(in_flight.len(), 1);
        in_flight.finish("x", second_gen);
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_superseded_render_stops_streaming() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "slow.json",
            r#"{"async_timeout": 20, "blocks":[{"segments":[
                {"type":"command","properties":{"command":"sleep 0.5; echo slow"}}
            ]}]}"#,
        );
        let coordinator = Arc::new(coordinator(""));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let path = path.clone();
            thread::spawn(move || {
                let mut sink = Vec::new();
                coordinator
                    .render(request(&path, "same"), &CancelToken::new(), &mut sink)
                    .unwrap();
                sink
            })
        };
        thread::sleep(Duration::from_millis(150));

        let mut second = Vec::new();
        coordinator
            .render(request(&path, "same"), &CancelToken::new(), &mut second)
            .unwrap();
        let first = first.join().unwrap();

        assert_eq!(first.len(), 1, "superseded render only sent its first update");
        assert_eq!(first[0].kind, ResponseType::Update);
        assert_eq!(second.last().unwrap().kind, ResponseType::Complete);
    }

    #[test]
    fn test_transport_cancel_sends_nothing_more() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "slow.json",
            r#"{"async_timeout": 20, "blocks":[{"segments":[
                {"type":"command","properties":{"command":"sleep 0.3; echo slow"}}
            ]}]}"#,
        );
        let coordinator = coordinator("");
        let transport = CancelToken::new();
        let canceller = transport.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let mut sink = Vec::new();
        coordinator.render(request(&path, "t"), &transport, &mut sink).unwrap();
        handle.join().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].kind, ResponseType::Update);
    }

    #[test]
    fn test_pending_cap_completes_with_placeholders() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "stuck.json",
            r#"{"async_timeout": 10, "blocks":[{"segments":[
                {"type":"text","properties":{"text":"ok"}},
                {"type":"command","properties":{"command":"sleep 2; echo late"}}
            ]}]}"#,
        );
        let coordinator = coordinator("").with_pending_timeout(Duration::from_millis(100));
        let mut sink = Vec::new();
        let start = Instant::now();
        coordinator
            .render(request(&path, "p"), &CancelToken::new(), &mut sink)
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        let last = sink.last().unwrap();
        assert_eq!(last.kind, ResponseType::Complete);
        assert_eq!(last.prompt("primary"), "ok");
    }

    #[test]
    fn test_config_cached_only_when_source_matches() {
        let dir = TempDir::new().unwrap();
        let good = write_config(&dir, "good.json", r#"{"blocks":[]}"#);
        let broken = write_config(&dir, "broken.json", "{ nope");
        let coordinator = coordinator("");

        coordinator.load_config(&good);
        assert!(coordinator.configs.get(&good).is_some());

        let fallback = coordinator.load_config(&broken);
        assert!(!fallback.blocks.is_empty(), "broken config falls back to the default");
        assert!(coordinator.configs.get(&broken).is_none());
    }

    #[test]
    fn test_empty_path_uses_daemon_default() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "default.json", r#"{"async_timeout": 7, "blocks":[]}"#);
        let coordinator = coordinator(&path);

        let config = coordinator.load_config("");
        assert_eq!(config.async_timeout(), Some(Duration::from_millis(7)));
        assert!(coordinator.configs.get(&path).is_some());
    }

    #[test]
    fn test_toggled_segments_hidden() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "two.json",
            r#"{"blocks":[{"segments":[
                {"type":"text","alias":"a","properties":{"text":"A"}},
                {"type":"text","alias":"b","properties":{"text":"B"}}
            ]}]}"#,
        );
        let coordinator = coordinator("");
        coordinator.cache.toggle_segments("s", &["b".to_string()]);

        let mut sink = Vec::new();
        coordinator
            .render(request(&path, "s"), &CancelToken::new(), &mut sink)
            .unwrap();
        assert_eq!(sink[0].prompt("primary"), "A");
    }
}
