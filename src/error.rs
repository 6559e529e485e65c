//! Error types shared by the daemon, its client and the prompt loader.

use std::io;
use thiserror::Error;

/// Errors produced by promptd components
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("daemon already running with PID {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch { client: u32, server: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("daemon not available: {0}")]
    Unavailable(String),

    #[error("failed to watch files: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid configuration {path}: {reason}")]
    Config { path: String, reason: String },
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub fn config(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
