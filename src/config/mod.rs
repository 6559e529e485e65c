//! Prompt configuration model
//!
//! The schema here is intentionally small: blocks of segments, an optional
//! include parent (`extends`), per-segment cache policies and the two daemon
//! knobs (`async_timeout`, `daemon_idle_timeout`). Parsing lives in [`load`].

pub mod load;

pub use load::{is_remote, load, resolve_path};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// A parsed prompt configuration
///
/// Cloning is deep: the daemon clones the cached prototype for each request so
/// request-local changes never reach the shared copy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path this configuration was loaded from; empty for the built-in default
    #[serde(skip)]
    pub source: String,
    /// Every local file or URL that contributed, child first
    #[serde(skip)]
    pub file_paths: Vec<String>,
    /// Hash over the raw contents of `file_paths`
    #[serde(skip)]
    pub hash: u64,

    pub extends: Option<String>,
    /// Initial response deadline in milliseconds (0 uses the daemon default)
    pub async_timeout: u64,
    /// Minutes without sessions before the daemon exits (0 disables)
    pub daemon_idle_timeout: Option<u64>,
    pub blocks: Vec<Block>,
    pub secondary_prompt: Option<ExtraPrompt>,
    pub transient_prompt: Option<ExtraPrompt>,
}

impl Config {
    pub fn async_timeout(&self) -> Option<Duration> {
        (self.async_timeout > 0).then(|| Duration::from_millis(self.async_timeout))
    }

    /// `Some(ZERO)` means idle shutdown is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.daemon_idle_timeout
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentConfig> {
        self.blocks.iter().flat_map(|b| b.segments.iter())
    }

    /// The configuration used when nothing (valid) was supplied
    pub fn default_prompt() -> Self {
        let segment = |kind: &str, foreground: &str| SegmentConfig {
            kind: kind.to_string(),
            foreground: Some(foreground.to_string()),
            ..Default::default()
        };

        Config {
            blocks: vec![
                Block {
                    kind: BlockType::Prompt,
                    newline: false,
                    segments: vec![
                        segment("session", "yellow"),
                        segment("path", "blue"),
                        segment("git", "magenta"),
                        segment("exit", "red"),
                    ],
                },
                Block {
                    kind: BlockType::RPrompt,
                    newline: false,
                    segments: vec![segment("executiontime", "dark_gray")],
                },
            ],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Prompt,
    RPrompt,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: BlockType,
    /// Start this block on a new line
    pub newline: bool,
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub alias: Option<String>,
    pub template: Option<String>,
    pub foreground: Option<String>,
    pub background: Option<String>,
    pub properties: HashMap<String, Value>,
    pub cache: Option<CachePolicy>,
}

impl SegmentConfig {
    /// Name used for caching and toggling
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.kind)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn property_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(Value::as_bool)
    }

    pub fn property_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtraPrompt {
    pub template: String,
    pub foreground: Option<String>,
    pub background: Option<String>,
}

/// User-facing cache strategy of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Session,
    Folder,
    Device,
}

/// How long a segment's text may be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheDuration {
    #[default]
    Empty,
    Infinite,
    Bounded(Duration),
}

impl CacheDuration {
    pub fn is_empty(&self) -> bool {
        matches!(self, CacheDuration::Empty)
    }
}

impl FromStr for CacheDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(CacheDuration::Empty),
            "infinite" => Ok(CacheDuration::Infinite),
            other => humantime::parse_duration(other).map(CacheDuration::Bounded),
        }
    }
}

impl<'de> Deserialize<'de> for CacheDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Segment-level `cache` block
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub strategy: Option<Strategy>,
    pub duration: CacheDuration,
}
