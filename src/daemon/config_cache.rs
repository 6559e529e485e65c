//! Parsed prompt configurations keyed by their source path.

use crate::config::{is_remote, Config};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifetime of a cached remote configuration
pub const REMOTE_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached parse; replaced wholesale, never mutated
#[derive(Debug)]
pub struct CachedConfig {
    pub config: Config,
    pub hash: u64,
    pub loaded_at: Instant,
    /// Only set for remote sources
    pub expires_at: Option<Instant>,
    pub file_paths: Vec<String>,
    pub is_remote: bool,
}

#[derive(Debug)]
pub struct ConfigCache {
    configs: RwLock<HashMap<String, Arc<CachedConfig>>>,
    remote_ttl: Duration,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::with_remote_ttl(REMOTE_TTL)
    }

    pub fn with_remote_ttl(remote_ttl: Duration) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            remote_ttl,
        }
    }

    /// Cached entry for `path`; stale remote entries count as missing
    pub fn get(&self, path: &str) -> Option<Arc<CachedConfig>> {
        let configs = self.configs.read();
        let cached = configs.get(path)?;

        if let Some(expires_at) = cached.expires_at {
            if Instant::now() > expires_at {
                return None;
            }
        }
        Some(Arc::clone(cached))
    }

    pub fn set(&self, path: &str, config: Config, file_paths: Vec<String>) -> Arc<CachedConfig> {
        let now = Instant::now();
        let remote = is_remote(path);

        let cached = Arc::new(CachedConfig {
            hash: config.hash,
            config,
            loaded_at: now,
            expires_at: remote.then(|| now + self.remote_ttl),
            file_paths,
            is_remote: remote,
        });

        self.configs
            .write()
            .insert(path.to_string(), Arc::clone(&cached));
        cached
    }

    pub fn invalidate(&self, path: &str) {
        if self.configs.write().remove(path).is_some() {
            tracing::debug!("config cache invalidated: {:?}", path);
        }
    }

    pub fn invalidate_all(&self) {
        self.configs.write().clear();
    }

    pub fn count(&self) -> usize {
        self.configs.read().len()
    }
}
