//! Per-request view of the shell that asked for a prompt
//!
//! Segments never read the daemon's own process state; everything comes from
//! the flags and environment variables the client sent along.

use crate::daemon::protocol::RenderFlags;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct Environment {
    flags: RenderFlags,
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn new(flags: RenderFlags, vars: HashMap<String, String>) -> Self {
        Self { flags, vars }
    }

    /// Build an environment from the current process (direct rendering)
    pub fn from_process(flags: RenderFlags) -> Self {
        Self::new(flags, std::env::vars().collect())
    }

    pub fn flags(&self) -> &RenderFlags {
        &self.flags
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Working directory, falling back to `$PWD`
    pub fn pwd(&self) -> &str {
        if !self.flags.pwd.is_empty() {
            return &self.flags.pwd;
        }
        self.getenv("PWD").unwrap_or("")
    }

    pub fn home(&self) -> Option<PathBuf> {
        self.getenv("HOME").map(PathBuf::from).or_else(dirs::home_dir)
    }

    pub fn shell(&self) -> &str {
        if !self.flags.shell.is_empty() {
            return &self.flags.shell;
        }
        self.getenv("SHELL")
            .and_then(|s| Path::new(s).file_name())
            .and_then(|s| s.to_str())
            .unwrap_or("")
    }

    /// Working directory with the home directory shortened to `~`
    pub fn pretty_pwd(&self) -> String {
        let pwd = self.pwd();
        if let Some(home) = self.home() {
            if let Ok(rest) = Path::new(pwd).strip_prefix(&home) {
                if rest.as_os_str().is_empty() {
                    return "~".to_string();
                }
                return format!("~/{}", rest.display());
            }
        }
        pwd.to_string()
    }
}
