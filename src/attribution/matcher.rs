//! Multi-signal attribution matcher
//!
//! Tiers are tried strongest first:
//!
//! ```text
//! session (300) → device containment (260) → IPs by position (280/260/240)
//!               → screen hash (200) → GPU hash (180)
//! ```
//!
//! The primary path reads the capped per-signal lookup records, and the full
//! index entry when the window reaches past a lookup's cut. A device signature
//! is found through its own lookup, a component lookup, or a containment scan
//! over device lookup keys. When nothing matches at any tier, the index-scan
//! fallback loads the full IP index entries and checks every member against
//! all five signals at a discount.
//! Lookup keys can collide after encoding, so every member's raw field value
//! is re-checked before it counts as a match.

use super::confidence::{AttributionMethod, ConfidenceWeights, LookupPath, Tier};
use super::query::AttributionQuery;
use crate::pipeline::index::{IndexEntry, SignalLookup};
use crate::pipeline::normalizer::Event;
use crate::store::keyspace::{encode_component, index_key, lookup_key, lookup_prefix};
use crate::store::{Facet, KvStore, StoreError, TERMINAL_CURSOR};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Keys examined per call when scanning device lookups by containment
const DEVICE_SCAN_COUNT: usize = 1000;
const DEVICE_SCAN_MAX_CALLS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Stop after the first tier that produced any match
    BestTier,
    /// Consult every tier and every IP (journey collection)
    Exhaustive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub event: Event,
    pub attribution_method: AttributionMethod,
    pub confidence: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    /// Deduplicated, best first
    pub matches: Vec<MatchResult>,
    /// Path that produced the matches, `None` when nothing matched
    pub path: Option<LookupPath>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub records_read: usize,
}

impl MatchReport {
    pub fn found(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn best(&self) -> Option<&MatchResult> {
        self.matches.first()
    }
}

pub struct Matcher {
    store: Arc<dyn KvStore>,
    weights: ConfidenceWeights,
}

impl Matcher {
    pub fn new(store: Arc<dyn KvStore>, weights: ConfidenceWeights) -> Self {
        Self { store, weights }
    }

    pub fn weights(&self) -> &ConfidenceWeights {
        &self.weights
    }

    pub async fn find_matches(
        &self,
        query: &AttributionQuery,
        mode: MatchMode,
    ) -> Result<MatchReport, StoreError> {
        let mut report = MatchReport {
            matches: Vec::new(),
            path: None,
            window_start: query.window_start(),
            window_end: query.window_end(),
            records_read: 0,
        };

        let mut found = self.primary_path(query, mode, &mut report.records_read).await?;
        if !found.is_empty() {
            report.path = Some(LookupPath::Primary);
        } else {
            found = self.index_scan_path(query, &mut report.records_read).await?;
            if !found.is_empty() {
                log::info!("🔎 No direct lookup hit, index scan found {} candidates", found.len());
                report.path = Some(LookupPath::IndexScan);
            }
        }

        report.matches = rank(found);
        log::debug!(
            "🎯 {} matches in [{}, {}] via {:?}",
            report.matches.len(),
            report.window_start,
            report.window_end,
            report.path
        );
        Ok(report)
    }

    async fn primary_path(
        &self,
        query: &AttributionQuery,
        mode: MatchMode,
        reads: &mut usize,
    ) -> Result<Vec<MatchResult>, StoreError> {
        let mut out = Vec::new();
        let short_circuit = mode == MatchMode::BestTier;

        if let Some(session) = query.session() {
            let hits = self
                .read_tier(Facet::Session, session, Tier::Session, query, reads, |e| {
                    e.signals.session_id.as_deref() == Some(session)
                })
                .await?;
            out.extend(hits);
            if short_circuit && !out.is_empty() {
                return Ok(out);
            }
        }

        if let Some(device) = query.device() {
            let mut hits = self
                .read_tier(Facet::Device, device, Tier::Device, query, reads, |e| {
                    device_contains(e, device)
                })
                .await?;
            if hits.is_empty() {
                hits = self.scan_device_lookups(device, query, reads).await?;
            }
            out.extend(hits);
            if short_circuit && !out.is_empty() {
                return Ok(out);
            }
        }

        for (ip, tier) in query.ip_candidates() {
            let hits = self
                .read_tier(Facet::Ip, &ip, tier, query, reads, |e| {
                    e.signals.ip.as_deref() == Some(ip.as_str())
                })
                .await?;
            let hit = !hits.is_empty();
            out.extend(hits);
            if short_circuit && hit {
                return Ok(out);
            }
        }

        if let Some(screen) = query.screen_hash() {
            let hits = self
                .read_tier(Facet::Screen, &screen, Tier::Screen, query, reads, |e| {
                    e.screen_hash().as_deref() == Some(screen.as_str())
                })
                .await?;
            out.extend(hits);
            if short_circuit && !out.is_empty() {
                return Ok(out);
            }
        }

        if let Some(gpu) = query.gpu_hash() {
            let hits = self
                .read_tier(Facet::Gpu, &gpu, Tier::Gpu, query, reads, |e| {
                    e.gpu_hash().as_deref() == Some(gpu.as_str())
                })
                .await?;
            out.extend(hits);
        }

        Ok(out)
    }

    async fn read_tier<F>(
        &self,
        facet: Facet,
        value: &str,
        tier: Tier,
        query: &AttributionQuery,
        reads: &mut usize,
        matches_raw: F,
    ) -> Result<Vec<MatchResult>, StoreError>
    where
        F: Fn(&Event) -> bool,
    {
        let Some(lookup) = self.read_lookup(&lookup_key(facet, value), reads).await? else {
            return Ok(Vec::new());
        };
        let members = self.window_members(lookup, query, reads).await?;
        Ok(self.credit(members, tier, query, matches_raw))
    }

    async fn read_lookup(&self, key: &str, reads: &mut usize) -> Result<Option<SignalLookup>, StoreError> {
        *reads += 1;
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) => {
                log::warn!("⚠️  Unreadable lookup {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// The lookup's members, or the full index entry's when the window reaches
    /// back past the oldest member the lookup kept
    async fn window_members(
        &self,
        lookup: SignalLookup,
        query: &AttributionQuery,
        reads: &mut usize,
    ) -> Result<Vec<Event>, StoreError> {
        let reaches_cut = lookup
            .members
            .first()
            .map_or(false, |oldest| query.window_start() <= oldest.timestamp);
        if !lookup.is_truncated() || !reaches_cut {
            return Ok(lookup.members);
        }

        let key = index_key(lookup.facet, &lookup.value);
        *reads += 1;
        let Some(raw) = self.store.get(&key).await? else {
            log::warn!("⚠️  Lookup {} is truncated but its index entry is missing", key);
            return Ok(lookup.members);
        };
        match IndexEntry::from_json(&raw) {
            Ok(entry) => {
                log::debug!(
                    "📥 Lookup for {} holds {} of {} members, read the full entry",
                    key,
                    lookup.members.len(),
                    lookup.total_events
                );
                Ok(entry.members)
            }
            Err(e) => {
                log::warn!("⚠️  Unreadable index entry {}: {}", key, e);
                Ok(lookup.members)
            }
        }
    }

    fn credit<F>(&self, members: Vec<Event>, tier: Tier, query: &AttributionQuery, matches_raw: F) -> Vec<MatchResult>
    where
        F: Fn(&Event) -> bool,
    {
        let method = AttributionMethod::primary(tier);
        let confidence = self.weights.score(method);
        members
            .into_iter()
            .filter(|e| query.in_window(e.timestamp) && matches_raw(e))
            .map(|event| MatchResult {
                event,
                attribution_method: method,
                confidence,
            })
            .collect()
    }

    /// Device lookups whose key contains the query signature. Used when no
    /// lookup is keyed by the signature or one of its components.
    async fn scan_device_lookups(
        &self,
        device: &str,
        query: &AttributionQuery,
        reads: &mut usize,
    ) -> Result<Vec<MatchResult>, StoreError> {
        let encoded = encode_component(device);
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("{}*{}*", lookup_prefix(Facet::Device), encoded);
        let exact = lookup_key(Facet::Device, device);

        let mut out = Vec::new();
        let mut cursor = TERMINAL_CURSOR.to_string();
        for _ in 0..DEVICE_SCAN_MAX_CALLS {
            let page = self.store.scan(&cursor, &pattern, DEVICE_SCAN_COUNT).await?;
            for key in page.keys.iter().filter(|k| **k != exact) {
                if let Some(lookup) = self.read_lookup(key, reads).await? {
                    let members = self.window_members(lookup, query, reads).await?;
                    out.extend(self.credit(members, Tier::Device, query, |e| device_contains(e, device)));
                }
            }
            if page.is_terminal() {
                return Ok(out);
            }
            cursor = page.next_cursor;
        }

        log::warn!(
            "⚠️  Device containment scan for {} stopped after {} calls",
            pattern,
            DEVICE_SCAN_MAX_CALLS
        );
        Ok(out)
    }

    /// Load full IP entries and credit each in-window member with the best
    /// signal it shares with the query
    async fn index_scan_path(
        &self,
        query: &AttributionQuery,
        reads: &mut usize,
    ) -> Result<Vec<MatchResult>, StoreError> {
        let ips = query.ip_candidates();
        let session = query.session();
        let device = query.device();
        let screen = query.screen_hash();
        let gpu = query.gpu_hash();

        let mut out = Vec::new();
        for (ip, _) in &ips {
            let key = index_key(Facet::Ip, ip);
            *reads += 1;
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let entry = match IndexEntry::from_json(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("⚠️  Unreadable index entry {}: {}", key, e);
                    continue;
                }
            };

            for event in entry.members {
                if !query.in_window(event.timestamp) {
                    continue;
                }

                let mut tiers: Vec<Tier> = Vec::new();
                if session.is_some() && event.signals.session_id.as_deref() == session {
                    tiers.push(Tier::Session);
                }
                if let Some(device) = device {
                    if device_contains(&event, device) {
                        tiers.push(Tier::Device);
                    }
                }
                if let Some(ip) = event.signals.ip.as_deref() {
                    if let Some((_, tier)) = ips.iter().find(|(candidate, _)| candidate == ip) {
                        tiers.push(*tier);
                    }
                }
                if screen.is_some() && event.screen_hash() == screen {
                    tiers.push(Tier::Screen);
                }
                if gpu.is_some() && event.gpu_hash() == gpu {
                    tiers.push(Tier::Gpu);
                }

                let best = tiers
                    .into_iter()
                    .map(AttributionMethod::index_scan)
                    .max_by_key(|m| self.weights.score(*m));
                if let Some(method) = best {
                    out.push(MatchResult {
                        confidence: self.weights.score(method),
                        attribution_method: method,
                        event,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Upstream may store a composite fingerprint that embeds the query signature
fn device_contains(event: &Event, device: &str) -> bool {
    event
        .signals
        .device_signature
        .as_deref()
        .map_or(false, |stored| stored.contains(device))
}

/// Deduplicate by `(timestamp ms, session or ip)` keeping the higher
/// confidence, then order by confidence descending, most recent first on ties
pub fn rank(results: Vec<MatchResult>) -> Vec<MatchResult> {
    let mut best: HashMap<(i64, String), MatchResult> = HashMap::new();
    for result in results {
        let key = (
            result.event.timestamp.timestamp_millis(),
            result.event.identity_key().to_string(),
        );
        match best.get(&key) {
            Some(existing) if existing.confidence >= result.confidence => {}
            _ => {
                best.insert(key, result);
            }
        }
    }

    let mut ranked: Vec<MatchResult> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then(b.event.timestamp.cmp(&a.event.timestamp))
            .then(a.event.store_key.cmp(&b.event.store_key))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::index::{IndexBuilder, IndexMaps};
    use crate::pipeline::normalizer::{IdentitySignals, Utm};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn conversion() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    fn create_test_event(key: &str, ts: DateTime<Utc>, signals: IdentitySignals) -> Event {
        Event {
            timestamp: ts,
            signals,
            landing_page: Some("https://example.com/pricing".to_string()),
            utm: Utm::default(),
            referrer: None,
            email: None,
            store_key: key.to_string(),
        }
    }

    async fn seeded_matcher(events: &[Event]) -> Matcher {
        let store = Arc::new(MemoryStore::new());
        let mut maps = IndexMaps::new();
        IndexBuilder::new(30, 100).build(events, &mut maps);
        for (key, entry) in &maps.entries {
            store.set(key, &entry.to_json().unwrap(), None).await.unwrap();
        }
        for (key, lookup) in &maps.lookups {
            store
                .set(key, &serde_json::to_string(lookup).unwrap(), None)
                .await
                .unwrap();
        }
        Matcher::new(store, ConfidenceWeights::default())
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_session_beats_ip() {
        let matcher = seeded_matcher(&[create_test_event(
            "pageview:1",
            at(10, 0),
            IdentitySignals {
                ip: Some("10.0.0.1".into()),
                session_id: Some("S1".into()),
                ..Default::default()
            },
        )])
        .await;

        let query = AttributionQuery::new(conversion())
            .with_session("S1")
            .with_ips(["10.0.0.1"]);
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();

        assert_eq!(report.matches.len(), 1);
        let best = report.best().unwrap();
        assert_eq!(best.confidence, 300);
        assert_eq!(best.attribution_method.label(), "session_id_match");
        assert_eq!(report.path, Some(LookupPath::Primary));
    }

    #[tokio::test]
    async fn test_exhaustive_dedups_to_highest() {
        let matcher = seeded_matcher(&[create_test_event(
            "pageview:1",
            at(10, 0),
            IdentitySignals {
                ip: Some("10.0.0.1".into()),
                session_id: Some("S1".into()),
                ..Default::default()
            },
        )])
        .await;

        let query = AttributionQuery::new(conversion())
            .with_session("S1")
            .with_ips(["10.0.0.1"]);
        let report = matcher.find_matches(&query, MatchMode::Exhaustive).await.unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].confidence, 300);
    }

    fn composite_device_events() -> Vec<Event> {
        vec![create_test_event(
            "pageview:1",
            at(9, 0),
            IdentitySignals {
                device_signature: Some("ua=x|canvas=abc123|tz=utc".into()),
                ..Default::default()
            },
        )]
    }

    #[tokio::test]
    async fn test_device_component_is_contained() {
        let matcher = seeded_matcher(&composite_device_events()).await;

        // Only one component of the stored composite is known at conversion
        let query = AttributionQuery::new(conversion()).with_device("canvas=abc123");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();

        assert_eq!(report.path, Some(LookupPath::Primary));
        assert_eq!(report.matches.len(), 1);
        let best = report.best().unwrap();
        assert_eq!(best.confidence, 260);
        assert_eq!(best.attribution_method, AttributionMethod::primary(Tier::Device));
        assert_eq!(best.event.store_key, "pageview:1");
    }

    #[tokio::test]
    async fn test_device_partial_substring_found_by_scan() {
        let matcher = seeded_matcher(&composite_device_events()).await;

        // Not a whole component, so no lookup is keyed by it
        let query = AttributionQuery::new(conversion()).with_device("abc12");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(report.path, Some(LookupPath::Primary));
        assert_eq!(report.best().unwrap().confidence, 260);

        // The full composite still resolves through its own lookup
        let query = AttributionQuery::new(conversion()).with_device("ua=x|canvas=abc123|tz=utc");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.best().unwrap().confidence, 260);
    }

    #[tokio::test]
    async fn test_device_not_contained_finds_nothing() {
        let matcher = seeded_matcher(&composite_device_events()).await;

        let query = AttributionQuery::new(conversion()).with_device("canvas=zzz999");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert!(!report.found());

        // Outside the window
        let query = AttributionQuery::new(at(8, 0)).with_device("canvas=abc123");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert!(!report.found());
    }

    #[tokio::test]
    async fn test_truncated_lookup_reads_full_entry() {
        let ip = IdentitySignals {
            ip: Some("10.9.9.9".into()),
            ..Default::default()
        };
        let mut events = vec![create_test_event("pageview:1", at(10, 0), ip.clone())];
        // 100 later visits push the in-window one out of the capped lookup
        let next_day = Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 0).unwrap();
        for i in 0..100 {
            events.push(create_test_event(
                &format!("pageview:{}", 100 + i),
                next_day + chrono::Duration::minutes(i),
                ip.clone(),
            ));
        }
        events.push(create_test_event(
            "pageview:9999",
            at(9, 0),
            IdentitySignals {
                screen_signature: Some("1920x1080x24".into()),
                ..Default::default()
            },
        ));
        let matcher = seeded_matcher(&events).await;

        let query = AttributionQuery::new(conversion())
            .with_ips(["10.9.9.9"])
            .with_screen("1920x1080x24");
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(report.path, Some(LookupPath::Primary));
        assert_eq!(report.matches.len(), 1);
        let best = report.best().unwrap();
        assert_eq!(best.confidence, 280);
        assert_eq!(best.attribution_method.label(), "ip_primary_match");
        assert_eq!(best.event.store_key, "pageview:1");

        let query = AttributionQuery::new(conversion()).with_ips(["10.9.9.9"]);
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(report.path, Some(LookupPath::Primary));
        assert_eq!(report.best().unwrap().confidence, 280);
    }

    #[tokio::test]
    async fn test_screen_and_gpu_tiers() {
        let matcher = seeded_matcher(&[
            create_test_event(
                "pageview:1",
                at(8, 0),
                IdentitySignals {
                    screen_signature: Some("1920x1080x24".into()),
                    ..Default::default()
                },
            ),
            create_test_event(
                "pageview:2",
                at(9, 0),
                IdentitySignals {
                    gpu_signature: Some("ANGLE (Apple M1)".into()),
                    ..Default::default()
                },
            ),
        ])
        .await;

        let query = AttributionQuery::new(conversion())
            .with_screen("1920X1080x24")
            .with_gpu("angle (apple m1)");
        let best_tier = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(best_tier.matches.len(), 1);
        assert_eq!(best_tier.matches[0].confidence, 200);

        let all = matcher.find_matches(&query, MatchMode::Exhaustive).await.unwrap();
        let scores: Vec<u32> = all.matches.iter().map(|m| m.confidence).collect();
        assert_eq!(scores, vec![200, 180]);
    }

    #[tokio::test]
    async fn test_stops_at_first_matching_ip() {
        let matcher = seeded_matcher(&[
            create_test_event(
                "pageview:1",
                at(10, 0),
                IdentitySignals {
                    ip: Some("1.1.1.1".into()),
                    ..Default::default()
                },
            ),
            create_test_event(
                "pageview:2",
                at(11, 0),
                IdentitySignals {
                    ip: Some("2.2.2.2".into()),
                    ..Default::default()
                },
            ),
        ])
        .await;

        let query = AttributionQuery::new(conversion()).with_ips(["1.1.1.1", "2.2.2.2"]);
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].confidence, 280);
        assert_eq!(report.matches[0].event.store_key, "pageview:1");
    }

    #[tokio::test]
    async fn test_index_scan_fallback_discounts() {
        let store = Arc::new(MemoryStore::new());
        let events = [create_test_event(
            "pageview:1",
            at(10, 0),
            IdentitySignals {
                ip: Some("10.0.0.1".into()),
                session_id: Some("S1".into()),
                ..Default::default()
            },
        )];
        // Only the full index entries exist, no lookup records
        let mut maps = IndexMaps::new();
        IndexBuilder::new(30, 100).build(&events, &mut maps);
        for (key, entry) in &maps.entries {
            store.set(key, &entry.to_json().unwrap(), None).await.unwrap();
        }

        let matcher = Matcher::new(store, ConfidenceWeights::default());
        let query = AttributionQuery::new(conversion())
            .with_session("S1")
            .with_ips(["10.0.0.1"]);
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();

        assert_eq!(report.path, Some(LookupPath::IndexScan));
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].confidence, 295);
        assert_eq!(
            report.matches[0].attribution_method,
            AttributionMethod::index_scan(Tier::Session)
        );
    }

    #[tokio::test]
    async fn test_nothing_found_is_not_an_error() {
        let matcher = seeded_matcher(&[]).await;
        let query = AttributionQuery::new(conversion())
            .with_session("nobody")
            .with_ips(["203.0.113.1"]);
        let report = matcher.find_matches(&query, MatchMode::BestTier).await.unwrap();
        assert!(!report.found());
        assert!(report.path.is_none());
    }

    #[test]
    fn test_rank_orders_and_dedups() {
        let mk = |key: &str, ts: DateTime<Utc>, session: &str, confidence: u32| MatchResult {
            event: create_test_event(
                key,
                ts,
                IdentitySignals {
                    session_id: Some(session.into()),
                    ..Default::default()
                },
            ),
            attribution_method: AttributionMethod::primary(Tier::Session),
            confidence,
        };

        let ranked = rank(vec![
            mk("pageview:1", at(9, 0), "a", 240),
            mk("pageview:2", at(10, 0), "b", 280),
            mk("pageview:1", at(9, 0), "a", 300),
            mk("pageview:3", at(11, 0), "c", 280),
        ]);

        let keys: Vec<(&str, u32)> = ranked
            .iter()
            .map(|m| (m.event.store_key.as_str(), m.confidence))
            .collect();
        assert_eq!(
            keys,
            vec![("pageview:1", 300), ("pageview:3", 280), ("pageview:2", 280)]
        );
    }
}
