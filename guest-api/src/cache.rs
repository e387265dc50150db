//! Namespaced key/value cache backing the `/cache` routes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Expiry applied to every write.
pub const CACHE_EXPIRES_AFTER: Duration = Duration::from_secs(7 * 24 * 3600);

/// Storage engine for cache entries. Keys arrive already namespaced.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool;
    /// Number of keys removed.
    fn delete(&self, key: &str) -> usize;
    /// Live keys matching a glob pattern (`*` any run, `?` one character).
    fn keys(&self, pattern: &str) -> Vec<String>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process store. Expired entries are dropped when next touched.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        let expires_at = Instant::now() + ttl;
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
        true
    }

    fn delete(&self, key: &str) -> usize {
        usize::from(self.lock().remove(key).is_some())
    }

    fn keys(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Match `text` against a pattern where `*` matches any run of characters
/// and `?` exactly one. Every other character is literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` and the text index it is currently covering
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, covered)) => {
                    p = star + 1;
                    t = covered + 1;
                    backtrack = Some((star, covered + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
