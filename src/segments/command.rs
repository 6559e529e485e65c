//! Segment that renders the first line of a shell command's output.

use super::Segment;
use crate::config::SegmentConfig;
use crate::environment::Environment;
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Debug, Default)]
pub struct CommandSegment {
    shell: String,
    command: String,
    output: String,
}

impl CommandSegment {
    pub fn new(config: &SegmentConfig) -> Self {
        Self {
            shell: config.property_str("shell").unwrap_or("sh").to_string(),
            command: config.property_str("command").unwrap_or_default().to_string(),
            output: String::new(),
        }
    }

    fn run(&self, env: &Environment) -> Option<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .envs(env.vars())
            .stdin(Stdio::null())
            .stderr(Stdio::null());

        let pwd = env.pwd();
        if !pwd.is_empty() && Path::new(pwd).is_dir() {
            cmd.current_dir(pwd);
        }

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("command segment failed to spawn '{}': {}", self.shell, e);
                return None;
            }
        };

        if !output.status.success() {
            tracing::debug!(
                "command segment exited with {}: {}",
                output.status.code().unwrap_or(-1),
                self.command
            );
            return None;
        }

        // First line only, trimmed
        Some(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string(),
        )
    }
}

impl Segment for CommandSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        if self.command.is_empty() {
            return false;
        }
        self.output = self.run(env).unwrap_or_default();
        !self.output.is_empty()
    }

    fn template(&self) -> &'static str {
        "{{ .Output }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("Output", self.output.clone())]
    }
}
