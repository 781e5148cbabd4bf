//! Chunked, resumable keyspace scanner
//!
//! Walks the store's cursor scan from a resume cursor, fetches candidate
//! pageview records in bounded concurrent batches, and normalizes them into
//! [`Event`]s. It always returns normally with the cursor it reached, so the
//! caller can persist progress and resume in a later invocation.
//!
//! Stop conditions, checked before each page:
//! 1. the store reported the terminal cursor (`is_complete = true`)
//! 2. the per-call iteration cap was hit
//! 3. the deadline (net of safety margin) passed
//!
//! A transient store failure stops at the start of the failing page: the
//! cursor is not advanced and that page's events are dropped, so the next
//! invocation re-reads the page rather than skipping it.

use super::deadline::Deadline;
use super::normalizer::{parse_event, Event};
use crate::store::{batch, KeyKind, KvStore, StoreError, TERMINAL_CURSOR};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Keys examined per store scan call
    pub scan_count: usize,
    /// Store reads in flight at once
    pub fetch_batch_size: usize,
    /// Safety cap on scan calls per `scan` invocation
    pub max_iterations: usize,
    pub deadline: Deadline,
    /// Events older than this are counted and dropped
    pub not_before: Option<DateTime<Utc>>,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            scan_count: 200,
            fetch_batch_size: 50,
            max_iterations: 500,
            deadline: Deadline::unbounded(),
            not_before: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    IterationCap,
    Deadline,
    StoreFailure,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub events: Vec<Event>,
    /// Position to resume from; equals the input cursor if nothing was consumed
    pub cursor: String,
    pub keys_scanned: u64,
    pub is_complete: bool,
    pub parse_failures: u64,
    /// Keys excluded by the keyspace registry (index, progress, cache...)
    pub skipped_keys: u64,
    /// Values that vanished between scan and fetch (expired or deleted)
    pub missing_values: u64,
    pub out_of_window: u64,
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// Transient failure that ended the scan early
    pub failure: Option<String>,
}

pub struct ChunkedScanner {
    store: Arc<dyn KvStore>,
}

struct PageResult {
    events: Vec<Event>,
    parse_failures: u64,
    skipped_keys: u64,
    missing_values: u64,
    out_of_window: u64,
}

impl ChunkedScanner {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Scan from `resume_cursor` until complete, capped, or out of budget.
    ///
    /// Only authorization failures are returned as `Err`.
    pub async fn scan(
        &self,
        pattern: &str,
        resume_cursor: &str,
        limits: &ScanLimits,
    ) -> Result<ScanOutcome, StoreError> {
        let mut outcome = ScanOutcome {
            events: Vec::new(),
            cursor: resume_cursor.to_string(),
            keys_scanned: 0,
            is_complete: false,
            parse_failures: 0,
            skipped_keys: 0,
            missing_values: 0,
            out_of_window: 0,
            iterations: 0,
            stop_reason: StopReason::IterationCap,
            failure: None,
        };

        loop {
            if outcome.iterations >= limits.max_iterations {
                outcome.stop_reason = StopReason::IterationCap;
                break;
            }
            if limits.deadline.is_exhausted() {
                log::info!(
                    "⏱️  Scan budget exhausted after {} iterations at cursor {}",
                    outcome.iterations,
                    outcome.cursor
                );
                outcome.stop_reason = StopReason::Deadline;
                break;
            }

            let page = match self
                .store
                .scan(&outcome.cursor, pattern, limits.scan_count)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("⚠️  Scan failed at cursor {}: {}", outcome.cursor, e);
                    outcome.failure = Some(e.to_string());
                    outcome.stop_reason = StopReason::StoreFailure;
                    break;
                }
            };
            outcome.iterations += 1;

            let result = match self.fetch_page(&page.keys, limits).await {
                Ok(result) => result,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!(
                        "⚠️  Fetch failed for page at cursor {} ({} keys): {}",
                        outcome.cursor,
                        page.keys.len(),
                        e
                    );
                    outcome.failure = Some(e.to_string());
                    outcome.stop_reason = StopReason::StoreFailure;
                    break;
                }
            };

            outcome.keys_scanned += page.keys.len() as u64;
            outcome.parse_failures += result.parse_failures;
            outcome.skipped_keys += result.skipped_keys;
            outcome.missing_values += result.missing_values;
            outcome.out_of_window += result.out_of_window;
            outcome.events.extend(result.events);
            outcome.cursor = page.next_cursor;

            if outcome.cursor == TERMINAL_CURSOR {
                outcome.is_complete = true;
                outcome.stop_reason = StopReason::Completed;
                break;
            }
        }

        log::debug!(
            "Scan stopped ({:?}): {} events, {} keys, {} parse failures, cursor {}",
            outcome.stop_reason,
            outcome.events.len(),
            outcome.keys_scanned,
            outcome.parse_failures,
            outcome.cursor
        );

        Ok(outcome)
    }

    /// Fetch and parse one page of keys; any store error fails the whole page
    async fn fetch_page(&self, keys: &[String], limits: &ScanLimits) -> Result<PageResult, StoreError> {
        let mut result = PageResult {
            events: Vec::new(),
            parse_failures: 0,
            skipped_keys: 0,
            missing_values: 0,
            out_of_window: 0,
        };

        let candidates: Vec<String> = keys
            .iter()
            .filter(|k| {
                let keep = KeyKind::classify(k).is_scan_candidate();
                if !keep {
                    result.skipped_keys += 1;
                }
                keep
            })
            .cloned()
            .collect();

        for group in candidates.chunks(limits.fetch_batch_size.max(1)) {
            let values = batch::get_many(self.store.as_ref(), group, limits.fetch_batch_size).await;

            for (key, value) in group.iter().zip(values) {
                let raw = match value? {
                    Some(raw) => raw,
                    None => {
                        result.missing_values += 1;
                        continue;
                    }
                };

                match parse_event(key, &raw) {
                    Ok(event) => {
                        if limits.not_before.map_or(false, |nb| event.timestamp < nb) {
                            result.out_of_window += 1;
                        } else {
                            result.events.push(event);
                        }
                    }
                    Err(e) => {
                        log::debug!("Skipping malformed record {}: {}", key, e);
                        result.parse_failures += 1;
                    }
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ScanPage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn seeded_store(pageviews: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..pageviews {
            let raw = format!(
                r#"{{"timestamp":{},"ip":"10.0.0.{}","session_id":"s{}"}}"#,
                1_751_364_000 + i as i64,
                i % 250,
                i
            );
            store.set(&format!("pageview:{:05}", i), &raw, None).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_unbounded_scan_reads_everything() {
        let store = seeded_store(120).await;
        store.set("pageview:bad", "{oops", None).await.unwrap();

        let scanner = ChunkedScanner::new(store);
        let limits = ScanLimits {
            scan_count: 17,
            ..ScanLimits::default()
        };
        let outcome = scanner.scan("*", TERMINAL_CURSOR, &limits).await.unwrap();

        assert!(outcome.is_complete);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.events.len(), 120);
        assert_eq!(outcome.parse_failures, 1);
        assert_eq!(outcome.cursor, TERMINAL_CURSOR);
    }

    #[tokio::test]
    async fn test_index_and_progress_keys_are_skipped() {
        let store = seeded_store(5).await;
        store.set("idx:v1:ip:10_0_0_1", "{}", None).await.unwrap();
        store.set("progress:index_job", "{}", None).await.unwrap();
        store.set("cache:journey:x", "{}", None).await.unwrap();

        let scanner = ChunkedScanner::new(store);
        let outcome = scanner
            .scan("*", TERMINAL_CURSOR, &ScanLimits::default())
            .await
            .unwrap();

        assert_eq!(outcome.events.len(), 5);
        assert_eq!(outcome.skipped_keys, 3);
        assert_eq!(outcome.parse_failures, 0);
    }

    #[tokio::test]
    async fn test_iteration_cap_returns_resumable_cursor() {
        let store = seeded_store(50).await;
        let scanner = ChunkedScanner::new(store);
        let limits = ScanLimits {
            scan_count: 10,
            max_iterations: 2,
            ..ScanLimits::default()
        };

        let first = scanner.scan("pageview:*", TERMINAL_CURSOR, &limits).await.unwrap();
        assert!(!first.is_complete);
        assert_eq!(first.stop_reason, StopReason::IterationCap);
        assert_eq!(first.events.len(), 20);
        assert_ne!(first.cursor, TERMINAL_CURSOR);

        let second = scanner.scan("pageview:*", &first.cursor, &limits).await.unwrap();
        assert_eq!(second.events.len(), 20);
        assert_eq!(second.events[0].store_key, "pageview:00020");
    }

    #[tokio::test]
    async fn test_expired_deadline_does_no_work() {
        let store = seeded_store(10).await;
        let scanner = ChunkedScanner::new(store);
        let limits = ScanLimits {
            deadline: Deadline::expired(),
            ..ScanLimits::default()
        };

        let outcome = scanner.scan("*", TERMINAL_CURSOR, &limits).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Deadline);
        assert!(!outcome.is_complete);
        assert_eq!(outcome.cursor, TERMINAL_CURSOR);
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn test_not_before_drops_old_events() {
        let store = seeded_store(10).await;
        let scanner = ChunkedScanner::new(store);
        let limits = ScanLimits {
            not_before: DateTime::from_timestamp(1_751_364_005, 0),
            ..ScanLimits::default()
        };

        let outcome = scanner.scan("*", TERMINAL_CURSOR, &limits).await.unwrap();
        assert_eq!(outcome.events.len(), 5);
        assert_eq!(outcome.out_of_window, 5);
    }

    /// Store whose reads start failing after a number of successful gets
    struct FlakyStore {
        inner: MemoryStore,
        gets_before_failure: usize,
        gets: AtomicUsize,
        fatal: bool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            if self.gets.fetch_add(1, Ordering::SeqCst) >= self.gets_before_failure {
                if self.fatal {
                    return Err(StoreError::Unauthorized("WRONGPASS".to_string()));
                }
                return Err(StoreError::Unavailable("HTTP 503".to_string()));
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
            self.inner.scan(cursor, pattern, count).await
        }
        fn backend_type(&self) -> &'static str {
            "Flaky"
        }
    }

    async fn flaky(gets_before_failure: usize, fatal: bool) -> Arc<FlakyStore> {
        let inner = MemoryStore::new();
        for i in 0..30 {
            inner
                .set(
                    &format!("pageview:{:03}", i),
                    &format!(r#"{{"ts":{}}}"#, 1_751_364_000 + i),
                    None,
                )
                .await
                .unwrap();
        }
        Arc::new(FlakyStore {
            inner,
            gets_before_failure,
            gets: AtomicUsize::new(0),
            fatal,
        })
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_advance_past_failed_page() {
        let store = flaky(15, false).await;
        let scanner = ChunkedScanner::new(store);
        let limits = ScanLimits {
            scan_count: 10,
            ..ScanLimits::default()
        };

        let outcome = scanner.scan("*", TERMINAL_CURSOR, &limits).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::StoreFailure);
        assert!(outcome.failure.is_some());
        // First page (10 keys) succeeded; the second page failed midway and is dropped
        assert_eq!(outcome.events.len(), 10);
        assert_eq!(outcome.keys_scanned, 10);
        assert_ne!(outcome.cursor, TERMINAL_CURSOR);
        assert!(!outcome.is_complete);
    }

    #[tokio::test]
    async fn test_authorization_failure_is_fatal() {
        let store = flaky(0, true).await;
        let scanner = ChunkedScanner::new(store);
        let err = scanner
            .scan("*", TERMINAL_CURSOR, &ScanLimits::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
