//! Session-partitioned value cache
//!
//! Every terminal session owns its own key space, so identical keys in two
//! sessions never collide and a session's entries disappear together when it
//! ends. Expired entries are dropped lazily on read and by a periodic
//! [`MemoryCache::evict_expired`] sweep.

use crate::config::Strategy;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default TTL for entries that do not name their own duration
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Key under which a session's toggled (hidden) segment names are kept
pub const TOGGLE_KEY: &str = "__toggled_segments";

/// Stand-in deadline for entries that never expire by time
const NEVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Daemon-side caching strategy
///
/// Extends the user-facing [`Strategy`] with `AsyncRendering`, the default
/// when a segment has no cache policy: the value is only ever a placeholder
/// while the segment recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    Session,
    Folder,
    AsyncRendering,
}

impl From<Option<Strategy>> for CacheStrategy {
    fn from(strategy: Option<Strategy>) -> Self {
        match strategy {
            Some(Strategy::Session) => CacheStrategy::Session,
            Some(Strategy::Folder) | Some(Strategy::Device) => CacheStrategy::Folder,
            None => CacheStrategy::AsyncRendering,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Text(String),
    Toggles(BTreeSet<String>),
}

impl CacheValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub strategy: CacheStrategy,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

type SessionEntries = Arc<Mutex<HashMap<String, CacheEntry>>>;

/// The daemon's in-memory value cache
#[derive(Debug)]
pub struct MemoryCache {
    sessions: RwLock<HashMap<String, SessionEntries>>,
    default_ttl: RwLock<Duration>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    pub fn with_default_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_ttl: RwLock::new(ttl),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        *self.default_ttl.read()
    }

    pub fn set_default_ttl(&self, ttl: Duration) {
        *self.default_ttl.write() = ttl;
    }

    fn session(&self, session_id: &str) -> Option<SessionEntries> {
        self.sessions.read().get(session_id).cloned()
    }

    fn session_or_insert(&self, session_id: &str) -> SessionEntries {
        if let Some(entries) = self.session(session_id) {
            return entries;
        }
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Value for `key` if present and not expired
    pub fn get(&self, session_id: &str, key: &str) -> Option<CacheValue> {
        self.get_with_metadata(session_id, key).map(|entry| entry.value)
    }

    /// Entry for `key` including its timestamps and strategy
    ///
    /// An expired entry is removed and reported as missing.
    pub fn get_with_metadata(&self, session_id: &str, key: &str) -> Option<CacheEntry> {
        let entries = self.session(session_id)?;
        let mut entries = entries.lock();

        let entry = entries.get(key)?;
        if entry.is_expired() {
            entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    /// Store with the `AsyncRendering` strategy
    pub fn set(&self, session_id: &str, key: &str, value: CacheValue, ttl: Duration) {
        self.set_with_strategy(session_id, key, value, CacheStrategy::AsyncRendering, ttl);
    }

    /// Store with an explicit strategy; a zero `ttl` never expires by time
    pub fn set_with_strategy(
        &self,
        session_id: &str,
        key: &str,
        value: CacheValue,
        strategy: CacheStrategy,
        ttl: Duration,
    ) {
        let now = Instant::now();
        let lifetime = if ttl.is_zero() { NEVER } else { ttl };
        let expires_at = now
            .checked_add(lifetime)
            .or_else(|| now.checked_add(NEVER))
            .unwrap_or(now);

        let entries = self.session_or_insert(session_id);
        entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                expires_at,
                strategy,
            },
        );
    }

    pub fn delete(&self, session_id: &str, key: &str) {
        if let Some(entries) = self.session(session_id) {
            entries.lock().remove(key);
        }
    }

    /// Drop every entry of one session
    pub fn clean_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    pub fn clear_all(&self) {
        self.sessions.write().clear();
    }

    /// Remove expired entries from every session
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let sessions: Vec<SessionEntries> = self.sessions.read().values().cloned().collect();

        let mut evicted = 0;
        for entries in sessions {
            let mut entries = entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired_at(now));
            evicted += before - entries.len();
        }
        evicted
    }

    /// Segment names currently hidden in a session
    pub fn toggles(&self, session_id: &str) -> BTreeSet<String> {
        match self.get(session_id, TOGGLE_KEY) {
            Some(CacheValue::Toggles(set)) => set,
            _ => BTreeSet::new(),
        }
    }

    /// Flip each name between hidden and shown; returns the new hidden set
    pub fn toggle_segments(&self, session_id: &str, names: &[String]) -> BTreeSet<String> {
        let entries = self.session_or_insert(session_id);
        let mut entries = entries.lock();

        let mut toggles = match entries.get(TOGGLE_KEY).map(|entry| &entry.value) {
            Some(CacheValue::Toggles(set)) => set.clone(),
            _ => BTreeSet::new(),
        };
        for name in names {
            if !toggles.remove(name) {
                toggles.insert(name.clone());
            }
        }

        let now = Instant::now();
        entries.insert(
            TOGGLE_KEY.to_string(),
            CacheEntry {
                value: CacheValue::Toggles(toggles.clone()),
                created_at: now,
                expires_at: now.checked_add(NEVER).unwrap_or(now),
                strategy: CacheStrategy::AsyncRendering,
            },
        );
        toggles
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn entry_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .map(|entries| entries.lock().len())
            .sum()
    }
}
