//! Per-user state locations
//!
//! Lock and socket live together in one private directory so that every
//! component (daemon, client, `promptd kill`) derives the same paths.

use super::config::DaemonSettings;
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "PROMPTD_STATE_DIR";

const SOCKET_NAME: &str = "daemon.sock";
const LOCK_NAME: &str = "daemon.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub state_dir: PathBuf,
    pub socket: PathBuf,
    pub lock: PathBuf,
}

impl DaemonPaths {
    /// Paths inside `dir`; nothing is created
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let state_dir = dir.into();
        Self {
            socket: state_dir.join(SOCKET_NAME),
            lock: state_dir.join(LOCK_NAME),
            state_dir,
        }
    }

    /// Paths for these settings, creating the state directory (0700)
    ///
    /// Both binaries resolve through here so the client dials the socket the
    /// daemon binds, whether the directory came from ~/.promptdrc or the
    /// environment.
    pub fn for_settings(settings: &DaemonSettings) -> Result<Self> {
        let dir = match &settings.state_dir {
            Some(dir) => dir.clone(),
            None => Self::default_state_dir()?,
        };
        let paths = Self::in_dir(dir);
        paths.ensure_state_dir()?;
        Ok(paths)
    }

    /// `$PROMPTD_STATE_DIR`, else `$XDG_STATE_HOME/promptd`, else `~/.local/state/promptd`
    pub fn default_state_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir).join("promptd"));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Daemon("could not determine home directory".to_string()))?;
        Ok(home.join(".local").join("state").join("promptd"))
    }

    pub fn ensure_state_dir(&self) -> Result<()> {
        create_private_dir(&self.state_dir)
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        let mut perms = fs::metadata(dir)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_dir_layout() {
        let paths = DaemonPaths::in_dir("/run/promptd");
        assert_eq!(paths.socket, PathBuf::from("/run/promptd/daemon.sock"));
        assert_eq!(paths.lock, PathBuf::from("/run/promptd/daemon.lock"));
    }

    #[test]
    fn test_state_dir_from_rc_settings() {
        let tmp = TempDir::new().unwrap();
        let rc = format!("PROMPTD_STATE_DIR=\"{}\"", tmp.path().join("rc-state").display());
        let settings = DaemonSettings::parse(&rc);

        let paths = DaemonPaths::for_settings(&settings).unwrap();
        assert_eq!(paths.socket, tmp.path().join("rc-state").join("daemon.sock"));
        assert_eq!(paths.lock, tmp.path().join("rc-state").join("daemon.lock"));
        assert!(paths.state_dir.is_dir());
    }

    #[test]
    fn test_state_dir_is_private() {
        let tmp = TempDir::new().unwrap();
        let paths = DaemonPaths::in_dir(tmp.path().join("state"));
        paths.ensure_state_dir().unwrap();

        let mode = fs::metadata(&paths.state_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
