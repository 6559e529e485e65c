//! Process liveness probes and exit notification
//!
//! [`wait_for_exit`] blocks on the best primitive the platform offers
//! (`pidfd` + `poll` on Linux, `kqueue` `EVFILT_PROC` on macOS/FreeBSD) and
//! falls back to polling [`is_process_running`] everywhere else.

use super::cancel::CancelToken;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Liveness poll interval for the fallback watcher
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest a native wait blocks before re-checking cancellation
const WAIT_SLICE_MS: i32 = 100;

/// Whether `pid` refers to a live (non-zombie) process
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format: "pid (comm) S ...", comm may itself contain ')'
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Whether `pid` is alive and looks like a promptd daemon
///
/// Guards lock recovery against pid reuse. Our own pid always counts; when
/// the executable cannot be determined the process is assumed to be ours.
pub fn is_daemon_process(pid: i32) -> bool {
    if pid == std::process::id() as i32 {
        return true;
    }
    if !is_process_running(pid) {
        return false;
    }

    let Some(name) = process_executable(pid) else {
        return true;
    };

    let own_name = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()));

    name.contains("promptd") || own_name.is_some_and(|own| own == name)
}

/// File name of the executable running as `pid`
pub fn process_executable(pid: i32) -> Option<String> {
    // Linux
    if let Ok(exe) = std::fs::read_link(format!("/proc/{}/exe", pid)) {
        return exe
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }

    // macOS / BSD
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let comm = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if comm.is_empty() {
        return None;
    }
    Path::new(&comm)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Block until `pid` exits or `cancel` fires
pub fn wait_for_exit(pid: i32, cancel: &CancelToken) {
    match native::wait(pid, cancel) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            debug!("process {} already gone", pid);
        }
        Err(e) => {
            debug!("native exit watch unavailable for {} ({}), polling", pid, e);
            poll_for_exit(pid, cancel);
        }
    }
}

/// Fallback: check liveness every [`POLL_INTERVAL`]
pub fn poll_for_exit(pid: i32, cancel: &CancelToken) {
    while is_process_running(pid) {
        if cancel.wait_timeout(POLL_INTERVAL) {
            return;
        }
    }
    debug!("process {} exit detected via polling", pid);
}

#[cfg(target_os = "linux")]
mod native {
    use super::{CancelToken, WAIT_SLICE_MS};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    pub fn wait(pid: i32, cancel: &CancelToken) -> io::Result<()> {
        // SAFETY: pidfd_open takes a pid and flags and returns a new fd or -1
        let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the fd was just created and is owned by nobody else
        let pidfd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let mut pollfd = libc::pollfd {
            fd: pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        while !cancel.is_cancelled() {
            // SAFETY: one valid pollfd for the duration of the call
            let ready = unsafe { libc::poll(&mut pollfd, 1, WAIT_SLICE_MS) };
            if ready > 0 {
                return Ok(());
            }
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod native {
    use super::{CancelToken, WAIT_SLICE_MS};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    pub fn wait(pid: i32, cancel: &CancelToken) -> io::Result<()> {
        // SAFETY: kqueue has no arguments and returns a new fd or -1
        let raw = unsafe { libc::kqueue() };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created fd, owned here
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: kevent is plain old data
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = pid as libc::uintptr_t;
        change.filter = libc::EVFILT_PROC;
        change.flags = libc::EV_ADD | libc::EV_ONESHOT;
        change.fflags = libc::NOTE_EXIT;

        // SAFETY: one change, no events requested
        let registered = unsafe {
            libc::kevent(
                kq.as_raw_fd(),
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if registered < 0 {
            return Err(io::Error::last_os_error());
        }

        let slice = libc::timespec {
            tv_sec: 0,
            tv_nsec: (WAIT_SLICE_MS as libc::c_long) * 1_000_000,
        };

        while !cancel.is_cancelled() {
            // SAFETY: zeroed kevent is a valid output buffer
            let mut event: libc::kevent = unsafe { std::mem::zeroed() };
            // SAFETY: one output event, bounded timeout
            let ready = unsafe {
                libc::kevent(kq.as_raw_fd(), std::ptr::null(), 0, &mut event, 1, &slice)
            };
            if ready > 0 {
                return Ok(());
            }
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
mod native {
    use super::CancelToken;
    use std::io;

    pub fn wait(_pid: i32, _cancel: &CancelToken) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no native process exit notification",
        ))
    }
}
