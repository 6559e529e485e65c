//! Daemon settings from ~/.promptdrc and the environment
//!
//! The rc file uses shell assignment syntax so it can be sourced as well:
//! - PROMPTD_CONFIG (default prompt configuration path)
//! - PROMPTD_IDLE_TIMEOUT (seconds without sessions before exiting, 0 disables)
//! - PROMPTD_CACHE_TTL_DAYS (initial default value cache TTL)
//! - PROMPTD_LOG_FILE (log to this file from startup)
//! - PROMPTD_STATE_DIR (lock and socket directory)
//!
//! Environment variables of the same name win over the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Idle shutdown delay when neither settings nor prompt config name one
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const KEYS: [&str; 5] = [
    "PROMPTD_CONFIG",
    "PROMPTD_IDLE_TIMEOUT",
    "PROMPTD_CACHE_TTL_DAYS",
    "PROMPTD_LOG_FILE",
    "PROMPTD_STATE_DIR",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    /// Prompt configuration used when a request names none
    pub config: String,
    /// `None` defers to the prompt configuration, then the default
    pub idle_timeout: Option<Duration>,
    pub cache_ttl_days: Option<u32>,
    pub log_file: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    /// Shut down when the daemon executable is replaced
    pub watch_binary: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            config: String::new(),
            idle_timeout: None,
            cache_ttl_days: None,
            log_file: None,
            state_dir: None,
            watch_binary: true,
        }
    }
}

impl DaemonSettings {
    /// Settings from ~/.promptdrc with environment overrides
    pub fn load() -> Self {
        let mut settings = Self::from_file(&Self::rc_path()).unwrap_or_default();
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                settings.apply(key, &value);
            }
        }
        settings
    }

    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".promptdrc")
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut settings = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                settings.apply(&key, &unquote(&value));
            }
        }

        settings
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "PROMPTD_CONFIG" => self.config = value.to_string(),
            "PROMPTD_IDLE_TIMEOUT" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.idle_timeout = Some(Duration::from_secs(secs));
                }
            }
            "PROMPTD_CACHE_TTL_DAYS" => {
                if let Ok(days) = value.parse::<u32>() {
                    self.cache_ttl_days = Some(days);
                }
            }
            "PROMPTD_LOG_FILE" => {
                self.log_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "PROMPTD_STATE_DIR" => {
                self.state_dir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            _ => {}
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_days
            .filter(|days| *days > 0)
            .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let settings = DaemonSettings::parse("");
        assert_eq!(settings, DaemonSettings::default());
        assert!(settings.watch_binary);
    }

    #[test]
    fn test_parse_all_keys() {
        let content = r#"
PROMPTD_CONFIG="~/.config/prompt.json"
PROMPTD_IDLE_TIMEOUT=0
PROMPTD_CACHE_TTL_DAYS='3'
PROMPTD_LOG_FILE=/tmp/promptd.log
PROMPTD_STATE_DIR="/run/user/1000/promptd"
"#;
        let settings = DaemonSettings::parse(content);

        assert_eq!(settings.config, "~/.config/prompt.json");
        assert_eq!(settings.idle_timeout, Some(Duration::ZERO));
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(3 * 86400)));
        assert_eq!(settings.log_file, Some(PathBuf::from("/tmp/promptd.log")));
        assert_eq!(settings.state_dir, Some(PathBuf::from("/run/user/1000/promptd")));
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# prompt daemon
export PROMPTD_IDLE_TIMEOUT=90
# PROMPTD_CONFIG=/ignored.json
"#;
        let settings = DaemonSettings::parse(content);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(90)));
        assert!(settings.config.is_empty());
    }

    #[test]
    fn test_invalid_numbers_ignored() {
        let settings = DaemonSettings::parse("PROMPTD_IDLE_TIMEOUT=soon\nPROMPTD_CACHE_TTL_DAYS=-1");
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.cache_ttl(), None);
    }

    #[test]
    fn test_invalid_keys_ignored() {
        assert_eq!(parse_assignment("NOT A KEY=1"), None);
        assert_eq!(
            parse_assignment("PROMPTD_CONFIG = a=b"),
            Some(("PROMPTD_CONFIG".to_string(), "a=b".to_string()))
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
