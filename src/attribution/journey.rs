//! Customer journey reconstruction
//!
//! Turns the full set of matches for a conversion into an ordered timeline:
//! per-touchpoint timing, page categories, transitions between touchpoints,
//! and first/last-touch summaries.

use super::matcher::MatchResult;
use super::pages::PageCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default lookback for journey collection (7 days)
pub const DEFAULT_LOOKBACK_HOURS: i64 = 168;

/// Silence longer than this between touchpoints counts as a return visit
pub const RETURN_GAP_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Touchpoint {
    pub timestamp: DateTime<Utc>,
    pub store_key: String,
    pub page: Option<String>,
    pub category: PageCategory,
    pub source: String,
    pub attribution_method: String,
    pub confidence: u32,
    pub time_since_previous_ms: Option<i64>,
    pub time_to_next_ms: Option<i64>,
    pub time_to_conversion_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionKind {
    SourceChange { from: String, to: String },
    CategoryChange { from: PageCategory, to: PageCategory },
    SamePageRevisit { page: String },
    ReturnAfterGap { gap_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Index of the later touchpoint
    pub at: usize,
    #[serde(flatten)]
    pub kind: TransitionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchSummary {
    pub timestamp: DateTime<Utc>,
    pub page: Option<String>,
    pub category: PageCategory,
    pub source: String,
    pub attribution_method: String,
    pub confidence: u32,
}

impl From<&Touchpoint> for TouchSummary {
    fn from(tp: &Touchpoint) -> Self {
        Self {
            timestamp: tp.timestamp,
            page: tp.page.clone(),
            category: tp.category,
            source: tp.source.clone(),
            attribution_method: tp.attribution_method.clone(),
            confidence: tp.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Journey {
    pub conversion: ConversionInfo,
    pub touchpoints: Vec<Touchpoint>,
    /// First to last touchpoint
    pub total_duration_ms: i64,
    /// First touchpoint to conversion
    pub time_to_conversion_ms: i64,
    pub unique_pages: usize,
    pub page_frequency: BTreeMap<String, usize>,
    pub first_touch: Option<TouchSummary>,
    pub last_touch: Option<TouchSummary>,
    pub attribution_score: u32,
    pub transitions: Vec<Transition>,
    pub source_breakdown: BTreeMap<String, usize>,
    pub category_breakdown: BTreeMap<String, usize>,
}

/// Cacheable digest of a journey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneySummary {
    pub conversion_id: String,
    /// Digest of the member store keys the journey was built from
    pub fingerprint: String,
    pub touchpoint_count: usize,
    pub unique_pages: usize,
    pub total_duration_ms: i64,
    pub time_to_conversion_ms: i64,
    pub attribution_score: u32,
    pub first_touch: Option<TouchSummary>,
    pub last_touch: Option<TouchSummary>,
    pub source_breakdown: BTreeMap<String, usize>,
    pub category_breakdown: BTreeMap<String, usize>,
    pub computed_at: DateTime<Utc>,
}

impl Journey {
    pub fn is_empty(&self) -> bool {
        self.touchpoints.is_empty()
    }

    pub fn summary(&self, fingerprint: &str) -> JourneySummary {
        JourneySummary {
            conversion_id: self.conversion.id.clone(),
            fingerprint: fingerprint.to_string(),
            touchpoint_count: self.touchpoints.len(),
            unique_pages: self.unique_pages,
            total_duration_ms: self.total_duration_ms,
            time_to_conversion_ms: self.time_to_conversion_ms,
            attribution_score: self.attribution_score,
            first_touch: self.first_touch.clone(),
            last_touch: self.last_touch.clone(),
            source_breakdown: self.source_breakdown.clone(),
            category_breakdown: self.category_breakdown.clone(),
            computed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct JourneyBuilder;

impl JourneyBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, matches: &[MatchResult], conversion: &ConversionInfo) -> Journey {
        let mut ordered: Vec<&MatchResult> = matches.iter().collect();
        ordered.sort_by(|a, b| {
            a.event
                .timestamp
                .cmp(&b.event.timestamp)
                .then_with(|| a.event.store_key.cmp(&b.event.store_key))
        });

        let conversion_ms = conversion.timestamp.timestamp_millis();
        let mut touchpoints: Vec<Touchpoint> = ordered
            .iter()
            .map(|m| {
                let page = m.event.normalized_page();
                let category = page
                    .as_deref()
                    .map(PageCategory::classify)
                    .unwrap_or(PageCategory::Other);
                Touchpoint {
                    timestamp: m.event.timestamp,
                    store_key: m.event.store_key.clone(),
                    page,
                    category,
                    source: m.event.traffic_source(),
                    attribution_method: m.attribution_method.label(),
                    confidence: m.confidence,
                    time_since_previous_ms: None,
                    time_to_next_ms: None,
                    time_to_conversion_ms: conversion_ms - m.event.timestamp.timestamp_millis(),
                }
            })
            .collect();

        for i in 1..touchpoints.len() {
            let gap = touchpoints[i].timestamp.timestamp_millis()
                - touchpoints[i - 1].timestamp.timestamp_millis();
            touchpoints[i].time_since_previous_ms = Some(gap);
            touchpoints[i - 1].time_to_next_ms = Some(gap);
        }

        let mut page_frequency: BTreeMap<String, usize> = BTreeMap::new();
        let mut source_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        let mut category_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        for tp in &touchpoints {
            if let Some(page) = &tp.page {
                *page_frequency.entry(page.clone()).or_insert(0) += 1;
            }
            *source_breakdown.entry(tp.source.clone()).or_insert(0) += 1;
            *category_breakdown
                .entry(tp.category.as_str().to_string())
                .or_insert(0) += 1;
        }

        let (total_duration_ms, time_to_conversion_ms) = match (touchpoints.first(), touchpoints.last()) {
            (Some(first), Some(last)) => (
                last.timestamp.timestamp_millis() - first.timestamp.timestamp_millis(),
                first.time_to_conversion_ms,
            ),
            _ => (0, 0),
        };

        Journey {
            conversion: conversion.clone(),
            total_duration_ms,
            time_to_conversion_ms,
            unique_pages: page_frequency.len(),
            first_touch: touchpoints.first().map(TouchSummary::from),
            last_touch: touchpoints.last().map(TouchSummary::from),
            attribution_score: touchpoints.iter().map(|t| t.confidence).max().unwrap_or(0),
            transitions: detect_transitions(&touchpoints),
            page_frequency,
            source_breakdown,
            category_breakdown,
            touchpoints,
        }
    }
}

fn detect_transitions(touchpoints: &[Touchpoint]) -> Vec<Transition> {
    let mut out = Vec::new();
    for (i, pair) in touchpoints.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        let at = i + 1;

        if let Some(gap) = next.time_since_previous_ms {
            if gap > RETURN_GAP_MINUTES * 60_000 {
                out.push(Transition {
                    at,
                    kind: TransitionKind::ReturnAfterGap {
                        gap_minutes: gap / 60_000,
                    },
                });
            }
        }
        if prev.source != next.source {
            out.push(Transition {
                at,
                kind: TransitionKind::SourceChange {
                    from: prev.source.clone(),
                    to: next.source.clone(),
                },
            });
        }
        if prev.category != next.category {
            out.push(Transition {
                at,
                kind: TransitionKind::CategoryChange {
                    from: prev.category,
                    to: next.category,
                },
            });
        }
        if let Some(page) = &next.page {
            if touchpoints[..at].iter().any(|tp| tp.page.as_ref() == Some(page)) {
                out.push(Transition {
                    at,
                    kind: TransitionKind::SamePageRevisit { page: page.clone() },
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::confidence::{AttributionMethod, Tier};
    use crate::pipeline::normalizer::{Event, IdentitySignals, Utm};
    use chrono::TimeZone;

    fn create_test_match(key: &str, h: u32, m: u32, page: &str, source: Option<&str>, confidence: u32) -> MatchResult {
        MatchResult {
            event: Event {
                timestamp: Utc.with_ymd_and_hms(2025, 7, 1, h, m, 0).unwrap(),
                signals: IdentitySignals {
                    session_id: Some("S1".into()),
                    ..Default::default()
                },
                landing_page: Some(page.to_string()),
                utm: Utm {
                    source: source.map(String::from),
                    ..Default::default()
                },
                referrer: None,
                email: None,
                store_key: key.to_string(),
            },
            attribution_method: AttributionMethod::primary(Tier::Session),
            confidence,
        }
    }

    fn create_test_conversion() -> ConversionInfo {
        ConversionInfo {
            id: "purchase:42".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap(),
            value: Some(49.0),
            email: None,
        }
    }

    #[test]
    fn test_empty_journey() {
        let journey = JourneyBuilder::new().build(&[], &create_test_conversion());
        assert!(journey.is_empty());
        assert_eq!(journey.attribution_score, 0);
        assert_eq!(journey.unique_pages, 0);
        assert!(journey.first_touch.is_none());
        assert!(journey.transitions.is_empty());
    }

    #[test]
    fn test_timeline_and_timing() {
        let matches = vec![
            create_test_match("pageview:3", 11, 30, "https://example.com/checkout", Some("google"), 280),
            create_test_match("pageview:1", 8, 0, "https://example.com/", Some("google"), 300),
            create_test_match("pageview:2", 8, 10, "https://example.com/pricing", Some("google"), 300),
        ];
        let journey = JourneyBuilder::new().build(&matches, &create_test_conversion());

        let keys: Vec<&str> = journey.touchpoints.iter().map(|t| t.store_key.as_str()).collect();
        assert_eq!(keys, vec!["pageview:1", "pageview:2", "pageview:3"]);

        let first = &journey.touchpoints[0];
        assert_eq!(first.time_since_previous_ms, None);
        assert_eq!(first.time_to_next_ms, Some(10 * 60_000));
        assert_eq!(first.time_to_conversion_ms, 4 * 3_600_000);
        assert_eq!(journey.touchpoints[2].time_to_next_ms, None);

        assert_eq!(journey.total_duration_ms, (3 * 60 + 30) * 60_000);
        assert_eq!(journey.time_to_conversion_ms, 4 * 3_600_000);
        assert_eq!(journey.attribution_score, 300);
        assert_eq!(journey.unique_pages, 3);
        assert_eq!(journey.first_touch.as_ref().unwrap().category, PageCategory::Homepage);
        assert_eq!(journey.last_touch.as_ref().unwrap().category, PageCategory::Checkout);
        assert_eq!(journey.source_breakdown.get("google"), Some(&3));
    }

    #[test]
    fn test_transitions() {
        let matches = vec![
            create_test_match("pageview:1", 8, 0, "https://example.com/pricing", Some("google"), 300),
            create_test_match("pageview:2", 8, 5, "https://example.com/blog/post", Some("newsletter"), 300),
            create_test_match("pageview:3", 10, 0, "https://example.com/pricing", Some("newsletter"), 300),
        ];
        let journey = JourneyBuilder::new().build(&matches, &create_test_conversion());
        let kinds: Vec<&TransitionKind> = journey.transitions.iter().map(|t| &t.kind).collect();

        assert!(kinds.contains(&&TransitionKind::SourceChange {
            from: "google".into(),
            to: "newsletter".into()
        }));
        assert!(kinds.contains(&&TransitionKind::CategoryChange {
            from: PageCategory::Pricing,
            to: PageCategory::Content
        }));
        assert!(kinds.contains(&&TransitionKind::ReturnAfterGap { gap_minutes: 115 }));
        assert!(kinds.contains(&&TransitionKind::SamePageRevisit {
            page: "example.com/pricing".into()
        }));
        assert_eq!(journey.page_frequency.get("example.com/pricing"), Some(&2));
    }

    #[test]
    fn test_exact_hour_gap_is_not_a_return() {
        let matches = vec![
            create_test_match("pageview:1", 8, 0, "https://example.com/a", None, 240),
            create_test_match("pageview:2", 9, 0, "https://example.com/a", None, 240),
        ];
        let journey = JourneyBuilder::new().build(&matches, &create_test_conversion());
        assert!(!journey
            .transitions
            .iter()
            .any(|t| matches!(t.kind, TransitionKind::ReturnAfterGap { .. })));
    }

    #[test]
    fn test_summary_carries_fingerprint() {
        let matches = vec![create_test_match("pageview:1", 8, 0, "https://example.com/", None, 260)];
        let journey = JourneyBuilder::new().build(&matches, &create_test_conversion());
        let summary = journey.summary("abc");
        assert_eq!(summary.fingerprint, "abc");
        assert_eq!(summary.touchpoint_count, 1);
        assert_eq!(summary.attribution_score, 260);
        assert_eq!(summary.source_breakdown.get("direct"), Some(&1));
    }
}
