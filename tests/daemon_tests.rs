//! End-to-end tests against an in-process daemon on a private state directory

use promptd::daemon::protocol::{read_message, write_message, Message};
use promptd::daemon::{
    CancelToken, Client, Daemon, DaemonPaths, DaemonSettings, MemoryCache, PromptRequest,
    RenderFlags, ResponseType, SessionManager, PROTOCOL_VERSION,
};
use promptd::Error;
use std::collections::HashMap;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct TestDaemon {
    paths: DaemonPaths,
    shutdown: CancelToken,
    sessions: SessionManager,
    cache: Arc<MemoryCache>,
    handle: Option<JoinHandle<promptd::Result<()>>>,
}

impl TestDaemon {
    fn start(dir: &Path, default_config: &str) -> Self {
        let paths = DaemonPaths::in_dir(dir.join("state"));
        let settings = DaemonSettings {
            config: default_config.to_string(),
            idle_timeout: Some(Duration::ZERO),
            watch_binary: false,
            ..Default::default()
        };

        let daemon = Daemon::new(settings, paths.clone()).unwrap();
        let shutdown = daemon.shutdown_handle();
        let sessions = daemon.sessions().clone();
        let cache = Arc::clone(daemon.cache());
        let handle = thread::spawn(move || daemon.serve());

        assert!(
            wait_until(Duration::from_secs(3), || Client::is_running(&paths.socket)),
            "daemon did not start listening"
        );

        Self {
            paths,
            shutdown,
            sessions,
            cache,
            handle: Some(handle),
        }
    }

    fn client(&self) -> Client {
        Client::connect(&self.paths.socket).unwrap()
    }

    fn stop(&mut self) -> promptd::Result<()> {
        self.shutdown.cancel();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn write_config(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path.to_string_lossy().into_owned()
}

fn text_config(text: &str) -> String {
    format!(
        r#"{{"blocks":[{{"segments":[{{"type":"text","properties":{{"text":"{}"}}}}]}}]}}"#,
        text
    )
}

fn flags(config_path: &str) -> RenderFlags {
    RenderFlags {
        config_path: config_path.to_string(),
        pwd: "/".to_string(),
        shell: "bash".to_string(),
        plain: true,
        ..Default::default()
    }
}

fn render_primary(client: &mut Client, config_path: &str, session: &str) -> String {
    let response = client
        .render_prompt_sync(flags(config_path), 0, session, HashMap::new())
        .unwrap();
    response.prompt("primary").to_string()
}

#[test]
fn test_streaming_fast_then_slow() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "slow.json",
        r#"{"async_timeout": 100, "blocks":[{"segments":[
            {"type":"text","alias":"fast","properties":{"text":"fast"}},
            {"type":"command","alias":"slow","properties":{"command":"sleep 2; echo slow"}}
        ]}]}"#,
    );
    let daemon = TestDaemon::start(dir.path(), "");
    let mut client = daemon.client();

    let start = Instant::now();
    let mut arrivals = Vec::new();
    let last = client
        .render_prompt(flags(&config), 0, "stream", HashMap::new(), |response| {
            arrivals.push((start.elapsed(), response.kind, response.prompt("primary").to_string()));
        })
        .unwrap();

    let (first_at, first_kind, first_text) = &arrivals[0];
    assert!(*first_at < Duration::from_millis(500), "first response took {:?}", first_at);
    assert_eq!(*first_kind, ResponseType::Update);
    assert_eq!(first_text, "fast");

    let (last_at, last_kind, last_text) = arrivals.last().unwrap();
    assert_eq!(*last_kind, ResponseType::Complete);
    assert!(*last_at >= Duration::from_millis(1900), "complete came early: {:?}", last_at);
    assert_eq!(last_text, "fast slow");
    assert_eq!(last.kind, ResponseType::Complete);
}

#[test]
fn test_second_daemon_is_refused() {
    let dir = TempDir::new().unwrap();
    let daemon = TestDaemon::start(dir.path(), "");

    let second = Daemon::new(
        DaemonSettings {
            watch_binary: false,
            ..Default::default()
        },
        daemon.paths.clone(),
    );
    assert!(matches!(second, Err(Error::AlreadyRunning { .. })));
}

#[test]
fn test_shutdown_removes_socket_and_lock() {
    let dir = TempDir::new().unwrap();
    let mut daemon = TestDaemon::start(dir.path(), "");
    assert!(daemon.paths.lock.exists());

    daemon.stop().unwrap();
    assert!(!daemon.paths.socket.exists());
    assert!(!daemon.paths.lock.exists());

    // The lock can be taken again once released
    let restarted = TestDaemon::start(dir.path(), "");
    assert!(restarted.paths.lock.exists());
}

#[test]
fn test_default_config_used_for_empty_path() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "default.json", &text_config("from-default"));
    let daemon = TestDaemon::start(dir.path(), &config);

    let mut client = daemon.client();
    assert_eq!(render_primary(&mut client, "", "d"), "from-default");
}

#[test]
fn test_admin_operations() {
    let dir = TempDir::new().unwrap();
    let daemon = TestDaemon::start(dir.path(), "");

    assert_eq!(daemon.client().cache_get_ttl().unwrap(), 7);
    daemon.client().cache_set_ttl(3).unwrap();
    assert_eq!(daemon.client().cache_get_ttl().unwrap(), 3);
    assert!(daemon.client().cache_set_ttl(0).is_err());

    let err = daemon.client().toggle_segment("", &["git".to_string()]).unwrap_err();
    assert!(matches!(err, Error::Daemon(msg) if msg.contains("missing session_id")));

    let log = dir.path().join("logs").join("promptd.log");
    daemon.client().set_logging(&log.to_string_lossy()).unwrap();
    assert!(log.exists());
    daemon.client().set_logging("").unwrap();

    daemon.cache.set(
        "s",
        "k",
        promptd::daemon::cache::CacheValue::Text("v".to_string()),
        Duration::ZERO,
    );
    daemon.client().cache_clear().unwrap();
    assert_eq!(daemon.cache.entry_count(), 0);
}

#[test]
fn test_toggle_hides_segments_per_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "two.json",
        r#"{"blocks":[{"segments":[
            {"type":"text","alias":"a","properties":{"text":"A"}},
            {"type":"text","alias":"b","properties":{"text":"B"}}
        ]}]}"#,
    );
    let daemon = TestDaemon::start(dir.path(), "");

    daemon.client().toggle_segment("one", &["b".to_string()]).unwrap();
    assert_eq!(render_primary(&mut daemon.client(), &config, "one"), "A");
    assert_eq!(render_primary(&mut daemon.client(), &config, "two"), "A B");

    daemon.client().toggle_segment("one", &["b".to_string()]).unwrap();
    assert_eq!(render_primary(&mut daemon.client(), &config, "one"), "A B");
}

#[test]
fn test_version_mismatch_fails_only_that_request() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "ok.json", &text_config("ok"));
    let daemon = TestDaemon::start(dir.path(), "");

    let mut stream = UnixStream::connect(&daemon.paths.socket).unwrap();
    let request = PromptRequest {
        version: PROTOCOL_VERSION + 1,
        session_id: "v".to_string(),
        request_id: "bad".to_string(),
        pid: 0,
        env: HashMap::new(),
        flags: flags(&config),
    };
    write_message(&mut stream, &Message::Render(request), 1).unwrap();

    match read_message(&mut stream).unwrap() {
        (Message::Response(response), 1) => {
            assert_eq!(response.kind, ResponseType::Complete);
            assert_eq!(response.request_id, "bad");
            assert!(response.error.contains("version"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(render_primary(&mut daemon.client(), &config, "v"), "ok");
}

#[test]
fn test_newer_request_supersedes_older() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "slow.json",
        r#"{"async_timeout": 20, "blocks":[{"segments":[
            {"type":"command","properties":{"command":"sleep 1; echo slow"}}
        ]}]}"#,
    );
    let daemon = TestDaemon::start(dir.path(), "");

    let socket = daemon.paths.socket.clone();
    let first_config = config.clone();
    let first = thread::spawn(move || {
        let mut client = Client::connect(&socket).unwrap();
        let mut kinds = Vec::new();
        let result = client.render_prompt(flags(&first_config), 0, "same", HashMap::new(), |r| {
            kinds.push(r.kind)
        });
        (result, kinds)
    });

    thread::sleep(Duration::from_millis(300));
    let second = daemon
        .client()
        .render_prompt_sync(flags(&config), 0, "same", HashMap::new())
        .unwrap();
    assert_eq!(second.kind, ResponseType::Complete);

    let (first_result, first_kinds) = first.join().unwrap();
    assert!(first_result.is_err(), "superseded stream must end without complete");
    assert_eq!(first_kinds, vec![ResponseType::Update]);
}

#[test]
fn test_atomic_config_saves_are_picked_up() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "prompt.json", &text_config("v0"));
    let daemon = TestDaemon::start(dir.path(), "");

    assert_eq!(render_primary(&mut daemon.client(), &config, "w"), "v0");

    for version in 1..=3 {
        let expected = format!("v{}", version);
        let tmp: PathBuf = dir.path().join(format!(".prompt.json.{}", version));
        fs::write(&tmp, text_config(&expected)).unwrap();
        fs::rename(&tmp, &config).unwrap();

        assert!(
            wait_until(Duration::from_secs(3), || {
                render_primary(&mut daemon.client(), &config, "w") == expected
            }),
            "save {} was not picked up",
            version
        );
    }
}

#[test]
fn test_session_dropped_when_shell_exits() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "fast.json", &text_config("hi"));
    let daemon = TestDaemon::start(dir.path(), "");

    let mut shell = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = shell.id() as i32;

    daemon
        .client()
        .render_prompt_sync(flags(&config), pid, "", HashMap::new())
        .unwrap();
    assert!(daemon.sessions.contains(pid));
    assert!(daemon.cache.session_count() >= 1);

    shell.kill().unwrap();
    shell.wait().unwrap();

    assert!(wait_until(Duration::from_secs(5), || !daemon.sessions.contains(pid)));
    assert!(wait_until(Duration::from_secs(1), || daemon.cache.toggles(&pid.to_string()).is_empty()
        && daemon.cache.get(&pid.to_string(), "text").is_none()));
}

#[test]
fn test_token_session_cache_cleaned_when_shell_exits() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "fast.json", &text_config("hi"));
    let daemon = TestDaemon::start(dir.path(), "");

    let mut shell = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = shell.id() as i32;
    let token = "tab-7f3a";
    let env = HashMap::from([("PROMPTD_SESSION_ID".to_string(), token.to_string())]);

    daemon
        .client()
        .render_prompt_sync(flags(&config), pid, token, env)
        .unwrap();
    assert_eq!(daemon.sessions.get(pid).unwrap().uuid, token);
    assert!(daemon.cache.get(token, "text").is_some());

    shell.kill().unwrap();
    shell.wait().unwrap();

    assert!(wait_until(Duration::from_secs(5), || !daemon.sessions.contains(pid)));
    assert!(wait_until(Duration::from_secs(1), || daemon.cache.get(token, "text").is_none()));
}

#[test]
fn test_connect_or_start_uses_running_daemon() {
    let dir = TempDir::new().unwrap();
    let daemon = TestDaemon::start(dir.path(), "");

    let mut started = false;
    let mut client = Client::connect_or_start(&daemon.paths, || {
        started = true;
        Ok(())
    })
    .unwrap();
    assert!(!started);
    assert_eq!(client.cache_get_ttl().unwrap(), 7);
}
