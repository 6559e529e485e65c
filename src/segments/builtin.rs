//! Segments computed purely from the request environment.

use super::Segment;
use crate::config::SegmentConfig;
use crate::environment::Environment;
use std::time::Duration;

/// Static text from the `text` property
#[derive(Debug, Default)]
pub struct TextSegment {
    text: String,
}

impl TextSegment {
    pub fn new(config: &SegmentConfig) -> Self {
        Self {
            text: config.property_str("text").unwrap_or_default().to_string(),
        }
    }
}

impl Segment for TextSegment {
    fn enabled(&mut self, _env: &Environment) -> bool {
        !self.text.is_empty()
    }

    fn template(&self) -> &'static str {
        "{{ .Text }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("Text", self.text.clone())]
    }
}

/// Working directory, home shortened to `~`
#[derive(Debug, Default)]
pub struct PathSegment {
    pretty: String,
    full: String,
}

impl Segment for PathSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        self.full = env.pwd().to_string();
        self.pretty = env.pretty_pwd();
        !self.full.is_empty()
    }

    fn template(&self) -> &'static str {
        "{{ .Path }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("Path", self.pretty.clone()), ("Full", self.full.clone())]
    }
}

/// Exit status of the previous command
#[derive(Debug, Default)]
pub struct ExitSegment {
    always_enabled: bool,
    code: i32,
}

impl ExitSegment {
    pub fn new(config: &SegmentConfig) -> Self {
        Self {
            always_enabled: config.property_bool("always_enabled").unwrap_or(false),
            code: 0,
        }
    }
}

impl Segment for ExitSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        self.code = env.flags().error_code;
        self.always_enabled || self.code != 0
    }

    fn template(&self) -> &'static str {
        "✘ {{ .Code }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("Code", self.code.to_string())]
    }
}

/// Duration of the previous command, shown past a threshold (ms)
#[derive(Debug, Default)]
pub struct ExecutionTimeSegment {
    threshold: f64,
    elapsed: Duration,
}

impl ExecutionTimeSegment {
    const DEFAULT_THRESHOLD_MS: u64 = 500;

    pub fn new(config: &SegmentConfig) -> Self {
        let threshold = config
            .property_u64("threshold")
            .unwrap_or(Self::DEFAULT_THRESHOLD_MS);
        Self {
            threshold: threshold as f64,
            elapsed: Duration::ZERO,
        }
    }
}

impl Segment for ExecutionTimeSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        let millis = env.flags().execution_time;
        if !millis.is_finite() || millis <= 0.0 || millis < self.threshold {
            return false;
        }
        self.elapsed = Duration::from_millis(millis.round() as u64);
        true
    }

    fn template(&self) -> &'static str {
        "{{ .FormattedMs }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "FormattedMs",
                humantime::format_duration(self.elapsed).to_string(),
            ),
            ("Ms", self.elapsed.as_millis().to_string()),
        ]
    }
}

/// Name (and version, when the client sent one) of the calling shell
#[derive(Debug, Default)]
pub struct ShellSegment {
    name: String,
    version: String,
}

impl Segment for ShellSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        self.name = env.shell().to_string();
        self.version = env.flags().shell_version.clone();
        !self.name.is_empty()
    }

    fn template(&self) -> &'static str {
        "{{ .Name }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("Name", self.name.clone()), ("Version", self.version.clone())]
    }
}

/// `user@host`, with the host only over SSH by default
#[derive(Debug, Default)]
pub struct SessionSegment {
    user: String,
    host: String,
    ssh: bool,
}

impl Segment for SessionSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        self.user = env
            .getenv("USER")
            .map(str::to_string)
            .unwrap_or_else(whoami::username);
        self.host = whoami::fallible::hostname().unwrap_or_default();
        self.ssh = env.getenv("SSH_CONNECTION").is_some() || env.getenv("SSH_CLIENT").is_some();
        !self.user.is_empty()
    }

    fn template(&self) -> &'static str {
        if self.ssh {
            "{{ .UserName }}@{{ .HostName }}"
        } else {
            "{{ .UserName }}"
        }
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("UserName", self.user.clone()),
            ("HostName", self.host.clone()),
            ("SSHSession", self.ssh.to_string()),
        ]
    }
}

/// Current local time, `time_format` is a chrono format string
#[derive(Debug, Default)]
pub struct TimeSegment {
    format: String,
    now: String,
}

impl TimeSegment {
    pub fn new(config: &SegmentConfig) -> Self {
        Self {
            format: config
                .property_str("time_format")
                .unwrap_or("%H:%M:%S")
                .to_string(),
            now: String::new(),
        }
    }
}

impl Segment for TimeSegment {
    fn enabled(&mut self, _env: &Environment) -> bool {
        use std::fmt::Write;

        let mut rendered = String::new();
        // chrono reports a bad format string through fmt::Error
        if write!(rendered, "{}", chrono::Local::now().format(&self.format)).is_err() {
            return false;
        }
        self.now = rendered;
        true
    }

    fn template(&self) -> &'static str {
        "{{ .CurrentDate }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("CurrentDate", self.now.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::RenderFlags;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(flags: RenderFlags) -> Environment {
        let mut vars = HashMap::new();
        vars.insert("HOME".to_string(), "/home/dev".to_string());
        vars.insert("USER".to_string(), "dev".to_string());
        Environment::new(flags, vars)
    }

    fn config(properties: serde_json::Value) -> SegmentConfig {
        serde_json::from_value(json!({ "type": "x", "properties": properties })).unwrap()
    }

    #[test]
    fn test_path_segment() {
        let mut segment = PathSegment::default();
        let env = env(RenderFlags {
            pwd: "/home/dev/project".to_string(),
            ..Default::default()
        });
        assert!(segment.enabled(&env));
        assert_eq!(segment.fields()[0].1, "~/project");
    }

    #[test]
    fn test_execution_time_threshold() {
        let mut segment = ExecutionTimeSegment::new(&config(json!({ "threshold": 1000 })));
        let fast = env(RenderFlags {
            execution_time: 250.0,
            ..Default::default()
        });
        assert!(!segment.enabled(&fast));

        let slow = env(RenderFlags {
            execution_time: 1500.0,
            ..Default::default()
        });
        assert!(segment.enabled(&slow));
        assert_eq!(segment.fields()[0].1, "1s 500ms");
    }

    #[test]
    fn test_exit_always_enabled() {
        let mut segment = ExitSegment::new(&config(json!({ "always_enabled": true })));
        assert!(segment.enabled(&env(RenderFlags::default())));
        assert_eq!(segment.fields()[0].1, "0");
    }

    #[test]
    fn test_session_prefers_user_var() {
        let mut segment = SessionSegment::default();
        assert!(segment.enabled(&env(RenderFlags::default())));
        assert_eq!(segment.template(), "{{ .UserName }}");
        assert_eq!(segment.fields()[0].1, "dev");
    }

    #[test]
    fn test_time_format() {
        let mut segment = TimeSegment::new(&config(json!({ "time_format": "%Y" })));
        assert!(segment.enabled(&Environment::default()));
        assert_eq!(segment.fields()[0].1.len(), 4);
    }
}
