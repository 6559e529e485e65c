//! Prompt rendering
//!
//! [`Engine`] owns one request's worth of state: a private copy of the
//! configuration, the slot for every segment and the channel through which
//! background segment threads report back. Segment text persistence goes
//! through the [`TextCache`] seam so the same engine serves both the daemon
//! (session-scoped cache) and direct rendering ([`NoCache`]).

mod engine;
mod writer;

pub use engine::{Engine, Progress};
pub use writer::PromptWriter;

use crate::config::CachePolicy;

/// Where rendered segment texts are remembered between requests
pub trait TextCache: Send + Sync {
    fn get(&self, name: &str, policy: Option<&CachePolicy>) -> Option<String>;

    /// Store a freshly computed text under the segment's cache policy
    fn set(&self, name: &str, text: &str, policy: Option<&CachePolicy>);

    /// `(recompute, use_stale_for_pending)` for the segment `name`
    fn should_recompute(&self, name: &str, policy: Option<&CachePolicy>) -> (bool, bool);
}

/// Cache that remembers nothing; every segment is computed every time
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl TextCache for NoCache {
    fn get(&self, _name: &str, _policy: Option<&CachePolicy>) -> Option<String> {
        None
    }

    fn set(&self, _name: &str, _text: &str, _policy: Option<&CachePolicy>) {}

    fn should_recompute(&self, _name: &str, _policy: Option<&CachePolicy>) -> (bool, bool) {
        (true, false)
    }
}
