//! One time-boxed index-job invocation
//!
//! ```text
//! load progress → [ scan → load existing → build → persist → checkpoint ]* → report
//! ```
//!
//! Each round checkpoints progress only after every entry it touched reached
//! the store. A round that could not persist in full leaves the stored cursor
//! where it was, so the next invocation re-scans those keys; membership makes
//! the repeat harmless.

use super::deadline::Deadline;
use super::index::{touched_index_keys, IndexBuilder, IndexMaps};
use super::persist::IndexPersister;
use super::progress::{ExtractionProgress, ProgressTracker};
use super::scanner::{ChunkedScanner, ScanLimits, StopReason};
use crate::api::JobRequest;
use crate::config::ConfigError;
use crate::store::keyspace::progress_key;
use crate::store::{KvStore, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum JobError {
    Store(StoreError),
    Config(ConfigError),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Store(e) => write!(f, "Store error: {}", e),
            JobError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for JobError {}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::Store(err)
    }
}

impl From<ConfigError> for JobError {
    fn from(err: ConfigError) -> Self {
        JobError::Config(err)
    }
}

/// Tunables for the job, normally from [`crate::config::AttribConfig`]
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_name: String,
    pub scan_pattern: String,
    pub scan_count: usize,
    pub fetch_batch_size: usize,
    pub write_batch_size: usize,
    /// Scan calls per round
    pub max_scan_iterations: usize,
    pub max_rounds: usize,
    pub budget: Duration,
    pub safety_margin: Duration,
    /// Share of the remaining budget a round may spend scanning
    pub scan_share: f64,
    pub index_ttl_days: i64,
    pub lookup_cap: usize,
    pub progress_ttl: Option<Duration>,
    pub restart_when_complete: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            job_name: "pageview-index".to_string(),
            scan_pattern: "pageview:*".to_string(),
            scan_count: 200,
            fetch_batch_size: 50,
            write_batch_size: 25,
            max_scan_iterations: 25,
            max_rounds: 40,
            budget: Duration::from_millis(55_000),
            safety_margin: Duration::from_millis(5_000),
            scan_share: 0.5,
            index_ttl_days: 30,
            lookup_cap: 100,
            progress_ttl: None,
            restart_when_complete: false,
        }
    }
}

impl JobSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scan_share > 0.0 && self.scan_share < 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "scan share must be between 0 and 1, got {}",
                self.scan_share
            )));
        }
        if self.safety_margin >= self.budget {
            return Err(ConfigError::InvalidValue(format!(
                "safety margin {}ms must be below the budget {}ms",
                self.safety_margin.as_millis(),
                self.budget.as_millis()
            )));
        }
        if self.scan_count == 0 || self.max_scan_iterations == 0 || self.max_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "scan count, iterations and rounds must be positive".to_string(),
            ));
        }
        if self.scan_pattern.is_empty() {
            return Err(ConfigError::InvalidValue("scan pattern cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub pageviews_extracted: u64,
    pub final_cursor: String,
    pub is_complete: bool,
    pub keys_scanned: u64,
    pub parse_failures: u64,
    pub entries_written: usize,
    pub lookups_written: usize,
    pub entries_deferred: usize,
    /// Why the invocation stopped short, if it did
    pub failed_chunk: Option<String>,
    pub rounds: usize,
    pub cycle: u64,
    pub elapsed: Duration,
}

impl JobReport {
    fn starting(progress: &ExtractionProgress) -> Self {
        Self {
            pageviews_extracted: 0,
            final_cursor: progress.cursor.clone(),
            is_complete: progress.is_complete,
            keys_scanned: 0,
            parse_failures: 0,
            entries_written: 0,
            lookups_written: 0,
            entries_deferred: 0,
            failed_chunk: None,
            rounds: 0,
            cycle: progress.cycle,
            elapsed: Duration::ZERO,
        }
    }
}

pub struct IndexJob {
    scanner: ChunkedScanner,
    tracker: ProgressTracker,
    builder: IndexBuilder,
    persister: IndexPersister,
    settings: JobSettings,
}

impl IndexJob {
    pub fn new(store: Arc<dyn KvStore>, settings: JobSettings) -> Self {
        let index_ttl = Duration::from_secs(settings.index_ttl_days.max(1) as u64 * 86_400);
        Self {
            scanner: ChunkedScanner::new(store.clone()),
            tracker: ProgressTracker::new(store.clone(), settings.progress_ttl),
            builder: IndexBuilder::new(settings.index_ttl_days, settings.lookup_cap),
            persister: IndexPersister::new(store, settings.write_batch_size, Some(index_ttl)),
            settings,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub async fn run(&self, request: &JobRequest) -> Result<JobReport, JobError> {
        self.settings.validate()?;
        let started = Instant::now();

        let budget = request
            .budget_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.budget);
        if self.settings.safety_margin >= budget {
            return Err(ConfigError::InvalidValue(format!(
                "budget {}ms leaves no time after the safety margin",
                budget.as_millis()
            ))
            .into());
        }
        let deadline = Deadline::new(budget, self.settings.safety_margin);
        let pattern = request
            .pattern
            .clone()
            .unwrap_or_else(|| self.settings.scan_pattern.clone());
        let key = progress_key(&self.settings.job_name);

        let mut progress = match self.tracker.load(&key).await {
            Ok(progress) => progress,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                log::warn!("⚠️  Could not read progress {}: {}", key, e);
                let mut report = JobReport::starting(&ExtractionProgress::default());
                report.failed_chunk = Some(format!("progress read failed: {}", e));
                report.elapsed = started.elapsed();
                return Ok(report);
            }
        };

        if request.reset || (progress.is_complete && self.settings.restart_when_complete) {
            log::info!("🔄 Starting completion cycle {}", progress.cycle + 1);
            progress.begin_cycle(Utc::now());
        } else if progress.is_complete {
            log::info!("✅ {} already complete at cycle {}, nothing to do", key, progress.cycle);
            let mut report = JobReport::starting(&progress);
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        if let Some(cursor) = &request.start_cursor {
            log::info!("📍 Resuming from caller cursor {}", cursor);
            progress.cursor = cursor.clone();
        }

        let mut report = JobReport::starting(&progress);
        let not_before = request
            .window_hours
            .filter(|h| *h > 0)
            .map(|h| Utc::now() - ChronoDuration::hours(h));

        log::info!(
            "🚀 Index job {} from cursor {} (budget {}ms, pattern {})",
            self.settings.job_name,
            progress.cursor,
            budget.as_millis(),
            pattern
        );

        while report.rounds < self.settings.max_rounds && !deadline.is_exhausted() {
            report.rounds += 1;

            let limits = ScanLimits {
                scan_count: request.chunk_size.unwrap_or(self.settings.scan_count).max(1),
                fetch_batch_size: self.settings.fetch_batch_size,
                max_iterations: self.settings.max_scan_iterations,
                deadline: deadline.fraction(self.settings.scan_share),
                not_before,
            };
            let outcome = self.scanner.scan(&pattern, &progress.cursor, &limits).await?;
            report.keys_scanned += outcome.keys_scanned;
            report.parse_failures += outcome.parse_failures;

            let mut maps = IndexMaps::new();
            if !outcome.events.is_empty() {
                let keys = touched_index_keys(&outcome.events);
                let loaded = self.persister.load_existing(&keys, &mut maps).await?;
                if !loaded.failed.is_empty() {
                    report.failed_chunk = Some(format!(
                        "could not load {} existing index entries at cursor {}",
                        loaded.failed.len(),
                        progress.cursor
                    ));
                    break;
                }

                self.builder.build(&outcome.events, &mut maps);
                let persisted = self.persister.persist(&maps, &deadline).await?;
                report.entries_written += persisted.written;
                report.lookups_written += persisted.lookups_written;
                report.entries_deferred += persisted.deferred;

                if !persisted.is_complete() {
                    report.failed_chunk = Some(match persisted.last_error {
                        Some(e) => format!("index write failed at cursor {}: {}", progress.cursor, e),
                        None => format!(
                            "{} index writes deferred at cursor {}",
                            persisted.deferred, progress.cursor
                        ),
                    });
                    break;
                }
            }

            let mut next = progress.clone();
            next.advance(
                &outcome.cursor,
                outcome.events.len() as u64,
                outcome.keys_scanned,
                outcome.parse_failures,
                outcome.is_complete,
                Utc::now(),
            );
            match self.tracker.save(&key, &next).await {
                Ok(saved) => progress = saved,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    // Entries are written; the rescan next time is idempotent
                    report.failed_chunk = Some(format!("progress write failed: {}", e));
                    break;
                }
            }
            report.pageviews_extracted += outcome.events.len() as u64;

            log::info!(
                "📊 Round {}: {} events, {} keys, cursor {}",
                report.rounds,
                outcome.events.len(),
                outcome.keys_scanned,
                progress.cursor
            );

            if let Some(failure) = outcome.failure {
                report.failed_chunk = Some(failure);
                break;
            }
            if outcome.is_complete || outcome.stop_reason == StopReason::Deadline {
                break;
            }
        }

        report.final_cursor = progress.cursor.clone();
        report.is_complete = progress.is_complete;
        report.cycle = progress.cycle;
        report.elapsed = started.elapsed();

        if report.is_complete {
            log::info!(
                "✅ Cycle {} complete: {} pageviews this run",
                report.cycle,
                report.pageviews_extracted
            );
        } else {
            log::info!(
                "⏱️  Stopping at cursor {} after {} rounds ({}ms)",
                report.final_cursor,
                report.rounds,
                report.elapsed.as_millis()
            );
        }
        Ok(report)
    }
}
