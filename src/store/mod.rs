//! Event Store Adapter
//!
//! A minimal command interface over the remote key-value store. Every other
//! component talks to the store only through [`KvStore`], so the batch job and
//! the matcher run unchanged against the hosted REST store, a local SQLite
//! file, or an in-memory map.
//!
//! ```text
//! KvStore (get / set / delete / scan)
//!     ├── RestStore    hosted Redis-compatible REST endpoint (reqwest)
//!     ├── SqliteStore  single-file local keyspace (rusqlite)
//!     └── MemoryStore  ordered in-process map (tests, dry runs)
//! ```
//!
//! Values are JSON text. Scan follows Redis semantics: the cursor is opaque,
//! `"0"` is both the start and the terminal position, and `count` bounds how
//! many keys are examined per call rather than how many are returned.

pub mod batch;
pub mod error;
pub mod keyspace;
pub mod memory;
pub mod rest;
pub mod sqlite;

pub use error::StoreError;
pub use keyspace::{encode_component, Facet, KeyKind};
pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use std::time::Duration;

/// Cursor value that starts a scan and signals its end
pub const TERMINAL_CURSOR: &str = "0";

/// One page of a cursor-based keyspace scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub next_cursor: String,
    pub keys: Vec<String>,
}

impl ScanPage {
    pub fn is_terminal(&self) -> bool {
        self.next_cursor == TERMINAL_CURSOR
    }
}

/// Command interface to the key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value, `None` when the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Examine up to `count` keys after `cursor`, returning those matching `pattern`
    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Compile a `SCAN MATCH` pattern: `*`, `?`, `[...]` classes and `\` escapes,
/// with `*` free to cross `:` and `/` as in Redis
pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher, StoreError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| StoreError::Protocol(format!("invalid pattern '{}': {}", pattern, e)))
}
