//! Prompt segments
//!
//! A segment computes a handful of named fields from the request
//! [`Environment`] and renders them through a template. The daemon only ever
//! calls [`execute`]; everything else is the per-type contract.

mod builtin;
mod command;
#[cfg(feature = "git-segment")]
mod git;

use crate::config::SegmentConfig;
use crate::environment::Environment;
use crate::template;

pub use builtin::{
    ExecutionTimeSegment, ExitSegment, PathSegment, SessionSegment, ShellSegment, TextSegment,
    TimeSegment,
};
pub use command::CommandSegment;
#[cfg(feature = "git-segment")]
pub use git::GitSegment;

/// The per-type segment contract
pub trait Segment: Send {
    /// Decide whether the segment shows up at all. Segments gather their
    /// fields here, so this is where the slow work happens.
    fn enabled(&mut self, env: &Environment) -> bool;

    /// Template used when the configuration does not supply one
    fn template(&self) -> &'static str;

    /// Values the template may reference as `{{ .Name }}`
    fn fields(&self) -> Vec<(&'static str, String)>;
}

/// Instantiate the segment named by `config.kind`, `None` for unknown types
pub fn new_segment(config: &SegmentConfig) -> Option<Box<dyn Segment>> {
    let segment: Box<dyn Segment> = match config.kind.as_str() {
        "text" => Box::new(TextSegment::new(config)),
        "path" => Box::new(PathSegment::default()),
        "exit" => Box::new(ExitSegment::new(config)),
        "executiontime" => Box::new(ExecutionTimeSegment::new(config)),
        "shell" => Box::new(ShellSegment::default()),
        "session" => Box::new(SessionSegment::default()),
        "time" => Box::new(TimeSegment::new(config)),
        "command" => Box::new(CommandSegment::new(config)),
        #[cfg(feature = "git-segment")]
        "git" => Box::new(GitSegment::default()),
        _ => return None,
    };
    Some(segment)
}

/// Run one segment to completion and return its rendered text
///
/// Disabled and unknown segments yield an empty string.
pub fn execute(config: &SegmentConfig, env: &Environment) -> String {
    let Some(mut segment) = new_segment(config) else {
        tracing::debug!("unknown segment type '{}'", config.kind);
        return String::new();
    };

    if !segment.enabled(env) {
        return String::new();
    }

    let template = config.template.as_deref().unwrap_or(segment.template());
    template::render(template, &segment.fields()).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::RenderFlags;
    use serde_json::json;
    use std::collections::HashMap;

    fn segment(kind: &str, properties: serde_json::Value) -> SegmentConfig {
        serde_json::from_value(json!({ "type": kind, "properties": properties })).unwrap()
    }

    #[test]
    fn test_unknown_type_renders_nothing() {
        let env = Environment::default();
        assert_eq!(execute(&segment("battery", json!({})), &env), "");
    }

    #[test]
    fn test_custom_template_overrides_default() {
        let mut config = segment("text", json!({ "text": "hi" }));
        config.template = Some("<{{ .Text }}>".to_string());
        assert_eq!(execute(&config, &Environment::default()), "<hi>");
    }

    #[test]
    fn test_exit_only_on_failure() {
        let config = segment("exit", json!({}));
        let ok = Environment::new(RenderFlags::default(), HashMap::new());
        assert_eq!(execute(&config, &ok), "");

        let failed = Environment::new(
            RenderFlags {
                error_code: 127,
                ..Default::default()
            },
            HashMap::new(),
        );
        assert!(execute(&config, &failed).contains("127"));
    }
}
