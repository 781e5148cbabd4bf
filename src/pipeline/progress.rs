//! Durable extraction progress
//!
//! One versioned record per named job, read at the start of every invocation
//! and written back whole at each checkpoint. There is no merge and no
//! compare-and-swap: the store only offers get/set, so two concurrent
//! invocations of the same job race and the later write wins. The job is
//! at-least-once either way (index writes are idempotent by membership), and
//! `save` logs when it detects that another writer got in between.

use crate::store::{KvStore, StoreError, TERMINAL_CURSOR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProgress {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Bumped on every save; used only to detect concurrent writers
    #[serde(default)]
    pub revision: u64,
    /// Completion cycles started so far
    #[serde(default)]
    pub cycle: u64,
    pub cursor: String,
    pub total_extracted: u64,
    pub total_keys_scanned: u64,
    #[serde(default)]
    pub parse_failures: u64,
    pub is_complete: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    PROGRESS_SCHEMA_VERSION
}

impl Default for ExtractionProgress {
    fn default() -> Self {
        Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            revision: 0,
            cycle: 0,
            cursor: TERMINAL_CURSOR.to_string(),
            total_extracted: 0,
            total_keys_scanned: 0,
            parse_failures: 0,
            is_complete: false,
            started_at: None,
            last_updated: None,
        }
    }
}

impl ExtractionProgress {
    /// The start cursor with `is_complete == false`
    pub fn is_fresh(&self) -> bool {
        self.cursor == TERMINAL_CURSOR && !self.is_complete && self.started_at.is_none()
    }

    /// Reset cursor and counters for a new pass over the keyspace
    pub fn begin_cycle(&mut self, now: DateTime<Utc>) {
        self.cycle += 1;
        self.cursor = TERMINAL_CURSOR.to_string();
        self.total_extracted = 0;
        self.total_keys_scanned = 0;
        self.parse_failures = 0;
        self.is_complete = false;
        self.started_at = Some(now);
        self.last_updated = Some(now);
    }

    /// Fold one successfully persisted chunk into the record
    pub fn advance(
        &mut self,
        cursor: &str,
        extracted: u64,
        keys_scanned: u64,
        parse_failures: u64,
        reached_end: bool,
        now: DateTime<Utc>,
    ) {
        self.cursor = cursor.to_string();
        self.total_extracted += extracted;
        self.total_keys_scanned += keys_scanned;
        self.parse_failures += parse_failures;
        self.is_complete = reached_end;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.last_updated = Some(now);
    }
}

pub struct ProgressTracker {
    store: Arc<dyn KvStore>,
    ttl: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn KvStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    /// Load progress, or the zero state when absent.
    ///
    /// An unreadable record is treated as absent: the job restarts its cycle,
    /// which costs a rescan but never loses data.
    pub async fn load(&self, key: &str) -> Result<ExtractionProgress, StoreError> {
        match self.store.get(key).await? {
            None => Ok(ExtractionProgress::default()),
            Some(raw) => match serde_json::from_str::<ExtractionProgress>(&raw) {
                Ok(progress) => Ok(progress),
                Err(e) => {
                    log::warn!("⚠️  Unreadable progress at {} ({}), starting fresh", key, e);
                    Ok(ExtractionProgress::default())
                }
            },
        }
    }

    /// Write the whole record, bumping its revision. Returns the saved record.
    pub async fn save(
        &self,
        key: &str,
        progress: &ExtractionProgress,
    ) -> Result<ExtractionProgress, StoreError> {
        if let Ok(Some(raw)) = self.store.get(key).await {
            if let Ok(current) = serde_json::from_str::<ExtractionProgress>(&raw) {
                if current.revision > progress.revision {
                    log::warn!(
                        "⚠️  Progress {} was advanced by another writer (revision {} > {}), overwriting",
                        key,
                        current.revision,
                        progress.revision
                    );
                }
            }
        }

        let mut saved = progress.clone();
        saved.revision = progress.revision + 1;
        let payload = serde_json::to_string(&saved)?;
        self.store.set(key, &payload, self.ttl).await?;

        log::debug!(
            "💾 Progress saved: {} rev={} cursor={} extracted={} complete={}",
            key,
            saved.revision,
            saved.cursor,
            saved.total_extracted,
            saved.is_complete
        );
        Ok(saved)
    }
}
