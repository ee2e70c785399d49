//! Working memory: a capacity- and time-bounded cache for session data.
//!
//! Entries expire `ttl` after they were written. Once the cache holds more
//! than `capacity` entries, the least recently accessed ones are evicted.
//! Reading a key moves it to the most recently used position; `exists` and
//! `list_keys` do not.
//!
//! There is no per-key locking: concurrent writers to one key resolve as
//! last write wins.

use cypherloom_config::CacheConfig;
use cypherloom_core::MemoryError;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CAPACITY: usize = 1000;

struct Entry {
    value: Value,
    /// `None` when the TTL reaches past the clock's range.
    expires_at: Option<Instant>,
    last_access: Instant,
    /// Position in the recency index.
    tick: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// tick -> key, oldest access first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = Instant::now();
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

/// Counters and limits for a [`WorkingCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub default_ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub struct WorkingCache {
    state: Mutex<CacheState>,
    capacity: usize,
    default_ttl: Duration,
}

impl WorkingCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.default_ttl_secs))
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value` under `key` for `ttl` (the default TTL when `None`),
    /// evicting least recently used entries beyond capacity.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), MemoryError> {
        if key.is_empty() {
            return Err(MemoryError::validation("key", "must not be empty"));
        }
        let now = Instant::now();
        let mut state = self.state();
        state.remove(key);
        let tick = state.next_tick;
        state.next_tick += 1;
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now.checked_add(ttl.unwrap_or(self.default_ttl)),
                last_access: now,
                tick,
            },
        );
        state.recency.insert(tick, key.to_string());

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            state.evictions += 1;
            debug!(key = %oldest, "Evicted least recently used entry");
        }
        Ok(())
    }

    /// `Ok(None)` for a key that was never set (or was evicted or deleted);
    /// [`MemoryError::Expired`] for a key whose TTL has passed.
    pub fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        let now = Instant::now();
        let mut state = self.state();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return Ok(None);
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return Err(MemoryError::Expired {
                key: key.to_string(),
            });
        }

        state.touch(key);
        state.hits += 1;
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state().remove(key).is_some()
    }

    /// Whether `key` holds a live entry. Does not count as an access.
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Time left before `key` expires; `Duration::MAX` for an entry that
    /// never does.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| {
                e.expires_at
                    .map_or(Duration::MAX, |at| at.saturating_duration_since(now))
            })
    }

    /// Remove everything. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let removed = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        removed
    }

    /// Live keys matching a glob (`*` any run, `?` any one character),
    /// sorted. Expired entries are purged first.
    pub fn list_keys(&self, pattern: &str) -> Vec<String> {
        let Ok(matcher) = glob_regex(pattern) else {
            return Vec::new();
        };
        let mut state = self.state();
        state.purge_expired(Instant::now());
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// When `key` was last read or written.
    pub fn last_access(&self, key: &str) -> Option<Instant> {
        self.state().entries.get(key).map(|e| e.last_access)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            default_ttl_secs: self.default_ttl.as_secs(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}

impl Default for WorkingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

fn glob_regex(pattern: &str) -> Result<regex_lite::Regex, regex_lite::Error> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex_lite::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex_lite::Regex::new(&re)
}
