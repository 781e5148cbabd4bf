//! Conversion attribution over the facet indexes
//!
//! [`Matcher`] ranks stored touchpoints against the signals captured at
//! conversion time; [`JourneyBuilder`] orders every match over a wider
//! lookback into a journey. [`AttributionService`] wires both to the store.

pub mod cache;
pub mod confidence;
pub mod journey;
pub mod matcher;
pub mod pages;
pub mod query;
pub mod service;

pub use cache::JourneyCache;
pub use confidence::{AttributionMethod, ConfidenceWeights, LookupPath, Tier};
pub use journey::{ConversionInfo, Journey, JourneyBuilder, JourneySummary, Touchpoint, Transition, TransitionKind};
pub use matcher::{MatchMode, MatchReport, MatchResult, Matcher};
pub use pages::PageCategory;
pub use query::AttributionQuery;
pub use service::AttributionService;
