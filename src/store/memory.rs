//! In-memory ordered store
//!
//! Keys live in a `BTreeMap`, so scans walk them in byte order. The cursor is
//! the hex-encoded last examined key, which stays valid when keys are inserted
//! or removed between calls.

use super::{compile_pattern, KvStore, ScanPage, StoreError, TERMINAL_CURSOR};
use async_trait::async_trait;
use globset::GlobMatcher;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    /// Compiled scan patterns, keyed by pattern text
    patterns: Mutex<HashMap<String, GlobMatcher>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys matching `pattern`, in order (test and diagnostic helper)
    pub fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = self.matcher(pattern)?;
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && matcher.is_match(k.as_str()))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn matcher(&self, pattern: &str) -> Result<GlobMatcher, StoreError> {
        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(matcher) = patterns.get(pattern) {
            return Ok(matcher.clone());
        }
        let matcher = compile_pattern(pattern)?;
        patterns.insert(pattern.to_string(), matcher.clone());
        Ok(matcher)
    }

    fn decode_cursor(cursor: &str) -> Result<Option<String>, StoreError> {
        if cursor == TERMINAL_CURSOR {
            return Ok(None);
        }
        let bytes = hex::decode(cursor)
            .map_err(|e| StoreError::Protocol(format!("invalid cursor '{}': {}", cursor, e)))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Protocol(format!("invalid cursor '{}': {}", cursor, e)))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let after = Self::decode_cursor(cursor)?;
        let matcher = self.matcher(pattern)?;
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let lower = match &after {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };

        let mut keys = Vec::new();
        let mut examined = 0usize;
        let mut last_examined: Option<&String> = None;
        let mut range = entries.range((lower, Bound::Unbounded));

        for (key, entry) in range.by_ref() {
            examined += 1;
            last_examined = Some(key);
            if entry.is_live(now) && matcher.is_match(key.as_str()) {
                keys.push(key.clone());
            }
            if examined >= count.max(1) {
                break;
            }
        }

        let exhausted = range.next().is_none();
        let next_cursor = match last_examined {
            Some(k) if !exhausted => hex::encode(k.as_bytes()),
            _ => TERMINAL_CURSOR.to_string(),
        };

        Ok(ScanPage { next_cursor, keys })
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}
