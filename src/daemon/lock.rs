//! Single-instance lock file
//!
//! The lock is a file holding the daemon's pid followed by a newline. It is
//! created exclusively at startup; an existing lock whose pid no longer refers
//! to a live daemon is treated as stale and replaced.

use super::process;
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `kill_daemon` waits for the killed process to disappear
const KILL_WAIT: Duration = Duration::from_secs(2);

/// An acquired daemon lock
///
/// Not released on drop: a daemon that dies without calling
/// [`LockFile::release`] leaves a stale lock that the next start recovers.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create the lock at `path` for the current process
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_inner(path, true)
    }

    fn acquire_inner(path: &Path, may_retry: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path);

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match read_pid(path) {
                    Ok(pid) if process::is_daemon_process(pid) => {
                        return Err(Error::AlreadyRunning { pid });
                    }
                    Ok(pid) => debug!("daemon process {} is not running, removing stale lock", pid),
                    Err(e) => debug!("unreadable lock file ({}), removing stale lock", e),
                }

                if !may_retry {
                    return Err(Error::Daemon(format!(
                        "could not replace stale lock {}",
                        path.display()
                    )));
                }
                remove_if_exists(path)?;
                return Self::acquire_inner(path, false);
            }
            Err(e) => return Err(e.into()),
        };

        let written = writeln!(file, "{}", std::process::id()).and_then(|_| file.sync_all());
        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(e.into());
        }

        info!("acquired daemon lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file
    pub fn release(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        debug!("released daemon lock {}", self.path.display());
        Ok(())
    }
}

/// Read the pid stored in a lock file
pub fn read_pid(path: &Path) -> Result<i32> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim();
    trimmed
        .parse()
        .map_err(|_| Error::Daemon(format!("invalid PID in lock file: '{}'", trimmed)))
}

/// Remove the lock unconditionally (crash recovery)
pub fn cleanup_lock(path: &Path) -> Result<()> {
    remove_if_exists(path)
}

/// Kill whatever daemon holds the lock at `path`, then remove the lock
///
/// A missing lock is not an error; a corrupt one is simply removed.
pub fn kill_daemon(path: &Path) -> Result<()> {
    let pid = match read_pid(path) {
        Ok(pid) => pid,
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(_) => return remove_if_exists(path),
    };

    if pid != std::process::id() as i32 && process::is_daemon_process(pid) {
        warn!("killing daemon process {}", pid);
        if let Err(e) = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        ) {
            warn!("failed to kill daemon {}: {}", pid, e);
        }

        let start = Instant::now();
        while process::is_process_running(pid) && start.elapsed() < KILL_WAIT {
            std::thread::sleep(process::POLL_INTERVAL);
        }
    }

    remove_if_exists(path)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
