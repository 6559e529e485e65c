//! promptd client
//!
//! Each request uses its own connection: the daemon answers one message per
//! connection and closes it afterwards.

use super::lock;
use super::paths::DaemonPaths;
use super::protocol::{
    read_message, write_message, AdminResponse, Message, MessageId, PromptRequest,
    PromptResponse, RenderFlags, ResponseType, ToggleSegmentRequest, PROTOCOL_VERSION,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to wait for a freshly started daemon to accept connections
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for administrative round trips
const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

const DAEMON_BINARY: &str = "promptd";

/// Client for the render daemon
pub struct Client {
    socket: PathBuf,
    stream: Option<UnixStream>,
    message_id: MessageId,
}

impl Client {
    /// Connect to the daemon listening on `socket`
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket)?;
        Ok(Self {
            socket: socket.to_path_buf(),
            stream: Some(stream),
            message_id: 0,
        })
    }

    /// Connect, starting the daemon once if nobody answers
    ///
    /// On a failed connect any stale daemon, lock and socket are cleared
    /// before `start` runs; then exactly one more connect is attempted.
    pub fn connect_or_start<F>(paths: &DaemonPaths, start: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()>,
    {
        match Self::connect(&paths.socket) {
            Ok(client) => return Ok(client),
            Err(e) => debug!("daemon not reachable ({}), starting it", e),
        }

        if let Err(e) = lock::kill_daemon(&paths.lock) {
            warn!("cannot clear stale daemon: {}", e);
        }
        if let Err(e) = fs::remove_file(&paths.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot remove stale socket: {}", e);
            }
        }

        start()?;
        wait_for_socket(&paths.socket, DIAL_TIMEOUT);

        Self::connect(&paths.socket).map_err(|e| Error::Unavailable(e.to_string()))
    }

    /// Whether a daemon is accepting connections on `socket`
    pub fn is_running(socket: &Path) -> bool {
        UnixStream::connect(socket).is_ok()
    }

    fn next_message_id(&mut self) -> MessageId {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }

    fn open_stream(&mut self) -> Result<UnixStream> {
        match self.stream.take() {
            Some(stream) => Ok(stream),
            None => Ok(UnixStream::connect(&self.socket)?),
        }
    }

    /// Render, handing every matching response to `on_response`
    ///
    /// Returns the final `complete` response. Responses carrying another
    /// request id are stale and skipped.
    pub fn render_prompt<F>(
        &mut self,
        flags: RenderFlags,
        pid: i32,
        session_id: &str,
        env: HashMap<String, String>,
        mut on_response: F,
    ) -> Result<PromptResponse>
    where
        F: FnMut(&PromptResponse),
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = PromptRequest {
            version: PROTOCOL_VERSION,
            session_id: session_id.to_string(),
            request_id: request_id.clone(),
            pid,
            env,
            flags,
        };

        let message_id = self.next_message_id();
        let mut stream = self.open_stream()?;
        write_message(&mut stream, &Message::Render(request), message_id)?;

        loop {
            let (message, _) = read_message(&mut stream)?;
            let response = match message {
                Message::Response(response) => response,
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected reply to render: {:?}",
                        other
                    )))
                }
            };

            if response.request_id != request_id {
                debug!("skipping stale response for {}", response.request_id);
                continue;
            }
            if !response.error.is_empty() {
                return Err(Error::Daemon(response.error));
            }

            on_response(&response);
            if response.kind == ResponseType::Complete {
                return Ok(response);
            }
        }
    }

    /// Render and return only the final prompt
    pub fn render_prompt_sync(
        &mut self,
        flags: RenderFlags,
        pid: i32,
        session_id: &str,
        env: HashMap<String, String>,
    ) -> Result<PromptResponse> {
        self.render_prompt(flags, pid, session_id, env, |_| {})
    }

    fn admin(&mut self, message: Message) -> Result<AdminResponse> {
        let message_id = self.next_message_id();
        let mut stream = self.open_stream()?;
        stream.set_read_timeout(Some(ADMIN_TIMEOUT))?;
        write_message(&mut stream, &message, message_id)?;

        match read_message(&mut stream)? {
            (Message::Ack(response), _) if response.success => Ok(response),
            (Message::Ack(response), _) => Err(Error::Daemon(response.error)),
            (other, _) => Err(Error::protocol(format!(
                "unexpected reply to admin request: {:?}",
                other
            ))),
        }
    }

    /// Flip the visibility of `segments` for one session
    pub fn toggle_segment(&mut self, session_id: &str, segments: &[String]) -> Result<()> {
        self.admin(Message::ToggleSegment(ToggleSegmentRequest {
            session_id: session_id.to_string(),
            segments: segments.to_vec(),
        }))?;
        Ok(())
    }

    pub fn cache_clear(&mut self) -> Result<()> {
        self.admin(Message::CacheClear)?;
        Ok(())
    }

    pub fn cache_set_ttl(&mut self, days: i32) -> Result<()> {
        self.admin(Message::CacheSetTtl { days })?;
        Ok(())
    }

    pub fn cache_get_ttl(&mut self) -> Result<i32> {
        Ok(self.admin(Message::CacheGetTtl)?.days)
    }

    /// Log to `path` on the daemon; an empty path turns file logging off
    pub fn set_logging(&mut self, path: &str) -> Result<()> {
        self.admin(Message::SetLogging {
            path: path.to_string(),
        })?;
        Ok(())
    }
}

/// Session id a shell without an explicit one is known by
pub fn session_id_for(pid: i32) -> String {
    pid.to_string()
}

/// Prompt strings of a render response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptResult {
    pub primary: String,
    pub right: String,
    pub secondary: Option<String>,
    pub transient: Option<String>,
}

pub fn extract_prompts(response: &PromptResponse) -> PromptResult {
    PromptResult {
        primary: response.prompt("primary").to_string(),
        right: response.prompt("right").to_string(),
        secondary: response.prompts.get("secondary").cloned(),
        transient: response.prompts.get("transient").cloned(),
    }
}

/// Start the daemon binary that sits next to the current executable
///
/// The daemon runs detached in its own process group with null stdio.
pub fn auto_start_daemon() -> Result<()> {
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Daemon("cannot determine executable directory".to_string()))?;
    let daemon = dir.join(DAEMON_BINARY);

    Command::new(&daemon)
        .arg("start")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| Error::Unavailable(format!("failed to start {}: {}", daemon.display(), e)))?;

    debug!("spawned {}", daemon.display());
    Ok(())
}

fn wait_for_socket(socket: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if socket.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
