//! [`TextCache`] backed by one session of the daemon's [`MemoryCache`].

use super::cache::{CacheStrategy, CacheValue, MemoryCache};
use crate::config::{CacheDuration, CachePolicy};
use crate::render::TextCache;
use std::sync::Arc;
use std::time::Duration;

/// Segment text cache for one request
///
/// Folder-scoped entries are keyed by the request's working directory as
/// well as the segment name.
pub struct SessionTextCache {
    cache: Arc<MemoryCache>,
    session_id: String,
    pwd: String,
}

impl SessionTextCache {
    pub fn new(cache: Arc<MemoryCache>, session_id: &str, pwd: &str) -> Self {
        Self {
            cache,
            session_id: session_id.to_string(),
            pwd: pwd.to_string(),
        }
    }

    fn key(&self, name: &str, policy: Option<&CachePolicy>) -> String {
        match policy.map(|p| CacheStrategy::from(p.strategy)) {
            Some(CacheStrategy::Folder) => format!("{}@{}", name, self.pwd),
            _ => name.to_string(),
        }
    }

    /// Store `text` with the strategy and TTL derived from `policy`
    pub fn set_with_config(&self, name: &str, text: &str, policy: Option<&CachePolicy>) {
        let (strategy, ttl) = match policy {
            None => (CacheStrategy::AsyncRendering, Duration::ZERO),
            Some(policy) => {
                let strategy = CacheStrategy::from(policy.strategy);
                let ttl = match (strategy, policy.duration) {
                    (CacheStrategy::Session, _) => Duration::ZERO,
                    (_, CacheDuration::Bounded(duration)) => duration,
                    _ => self.cache.default_ttl(),
                };
                (strategy, ttl)
            }
        };

        self.cache.set_with_strategy(
            &self.session_id,
            &self.key(name, policy),
            CacheValue::Text(text.to_string()),
            strategy,
            ttl,
        );
    }
}

impl TextCache for SessionTextCache {
    fn get(&self, name: &str, policy: Option<&CachePolicy>) -> Option<String> {
        self.cache
            .get(&self.session_id, &self.key(name, policy))?
            .as_text()
            .map(str::to_string)
    }

    fn set(&self, name: &str, text: &str, policy: Option<&CachePolicy>) {
        self.set_with_config(name, text, policy);
    }

    fn should_recompute(&self, name: &str, policy: Option<&CachePolicy>) -> (bool, bool) {
        let Some(entry) = self
            .cache
            .get_with_metadata(&self.session_id, &self.key(name, policy))
        else {
            return (true, false);
        };

        let has_text = entry.value.as_text().is_some_and(|text| !text.is_empty());

        let Some(policy) = policy else {
            return (true, has_text);
        };

        match policy.duration {
            CacheDuration::Empty | CacheDuration::Infinite
                if entry.strategy == CacheStrategy::AsyncRendering =>
            {
                (true, has_text)
            }
            CacheDuration::Infinite => (false, false),
            CacheDuration::Empty => (true, has_text),
            CacheDuration::Bounded(max_age) => {
                if entry.age() <= max_age {
                    (false, false)
                } else {
                    (true, has_text)
                }
            }
        }
    }
}
