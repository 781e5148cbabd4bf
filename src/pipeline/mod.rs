//! # Batch index pipeline
//!
//! Turns the raw pageview keyspace into per-facet indexes, one time-boxed
//! invocation at a time.
//!
//! ```text
//! KvStore ──scan──> ChunkedScanner ──Event──> IndexBuilder ──IndexMaps──> IndexPersister ──> KvStore
//!                        │                                                      │
//!                        └──────────── cursor ── ProgressTracker <── checkpoint ┘
//! ```
//!
//! ## Invariants
//!
//! - The stored cursor only moves past keys whose events were fully indexed.
//! - Index membership is by store key, so replaying a chunk adds nothing.
//! - Every unit of work checks the [`Deadline`] first; a run that runs out of
//!   time returns a report with partial progress instead of failing.

pub mod deadline;
pub mod index;
pub mod job;
pub mod normalizer;
pub mod persist;
pub mod progress;
pub mod scanner;

pub use deadline::Deadline;
pub use index::{BuildStats, FacetAggregates, IndexBuilder, IndexEntry, IndexMaps, SignalLookup};
pub use job::{IndexJob, JobError, JobReport, JobSettings};
pub use normalizer::{Event, IdentitySignals, ParseError, Utm};
pub use persist::{IndexPersister, LoadReport, PersistReport};
pub use progress::{ExtractionProgress, ProgressTracker};
pub use scanner::{ChunkedScanner, ScanLimits, ScanOutcome, StopReason};
