//! Facet indexes over normalized events
//!
//! Each facet value (an IP, a session id, a landing page...) owns one
//! [`IndexEntry`] listing every event seen with that value. Entries are keyed
//! by their encoded store key, so two raw values that encode to the same key
//! share an entry; readers must re-check raw field values on the members.
//!
//! Members stay sorted by `(timestamp, store_key)` and aggregates are always
//! recomputed from members, so the stored entry depends only on the set of
//! events that went in, never on the order they arrived in.

use super::normalizer::Event;
use crate::store::keyspace::{index_key, lookup_key, Facet};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const INDEX_ENTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetAggregates {
    pub event_count: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub distinct_ips: usize,
    pub distinct_sessions: usize,
    pub distinct_landing_pages: usize,
    pub distinct_sources: usize,
}

impl FacetAggregates {
    fn from_members(members: &[Event]) -> Self {
        let mut ips = HashSet::new();
        let mut sessions = HashSet::new();
        let mut pages = HashSet::new();
        let mut sources = HashSet::new();

        for event in members {
            if let Some(ip) = &event.signals.ip {
                ips.insert(ip.as_str());
            }
            if let Some(session) = &event.signals.session_id {
                sessions.insert(session.as_str());
            }
            if let Some(page) = event.normalized_page() {
                pages.insert(page);
            }
            sources.insert(event.traffic_source());
        }

        Self {
            event_count: members.len() as u64,
            // members are sorted, so the ends are the extremes
            earliest: members.first().map(|e| e.timestamp),
            latest: members.last().map(|e| e.timestamp),
            distinct_ips: ips.len(),
            distinct_sessions: sessions.len(),
            distinct_landing_pages: pages.len(),
            distinct_sources: sources.len(),
        }
    }
}

/// Every event seen for one facet value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub version: u32,
    pub facet: Facet,
    /// Raw (normalized, unencoded) facet value of the first writer
    pub value: String,
    pub members: Vec<Event>,
    pub aggregates: FacetAggregates,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    member_keys: HashSet<String>,
}

impl IndexEntry {
    pub fn new(facet: Facet, value: &str, now: DateTime<Utc>) -> Self {
        Self {
            version: INDEX_ENTRY_VERSION,
            facet,
            value: value.to_string(),
            members: Vec::new(),
            aggregates: FacetAggregates::default(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            member_keys: HashSet::new(),
        }
    }

    /// Decode a stored entry and rebuild its membership set
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut entry: IndexEntry = serde_json::from_str(raw)?;
        entry.member_keys = entry.members.iter().map(|m| m.store_key.clone()).collect();
        Ok(entry)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn contains(&self, store_key: &str) -> bool {
        self.member_keys.contains(store_key)
    }

    /// Add an event unless its store key is already a member.
    ///
    /// Aggregates are not touched here; call [`IndexEntry::refresh`] once the
    /// batch is in.
    pub fn insert(&mut self, event: &Event) -> bool {
        if self.member_keys.contains(&event.store_key) {
            return false;
        }
        let pos = self
            .members
            .binary_search_by(|m| {
                (m.timestamp, m.store_key.as_str()).cmp(&(event.timestamp, event.store_key.as_str()))
            })
            .unwrap_or_else(|pos| pos);
        self.members.insert(pos, event.clone());
        self.member_keys.insert(event.store_key.clone());
        true
    }

    /// Recompute aggregates and stamp the new expiry
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.aggregates = FacetAggregates::from_members(&self.members);
        self.updated_at = now;
        self.expires_at = Some(now + ttl);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Capped, most-recent-first-readable view of one identity-signal value.
/// This is what the matcher's primary path reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalLookup {
    pub version: u32,
    pub facet: Facet,
    pub value: String,
    /// Most recent members, ascending by `(timestamp, store_key)`
    pub members: Vec<Event>,
    /// Members in the full entry when this view was cut
    pub total_events: u64,
    pub updated_at: DateTime<Utc>,
}

impl SignalLookup {
    pub fn from_entry(entry: &IndexEntry, cap: usize) -> Self {
        let skip = entry.members.len().saturating_sub(cap);
        Self {
            version: INDEX_ENTRY_VERSION,
            facet: entry.facet,
            value: entry.value.clone(),
            members: entry.members[skip..].to_vec(),
            total_events: entry.members.len() as u64,
            updated_at: entry.updated_at,
        }
    }

    /// Whether older members were cut off
    pub fn is_truncated(&self) -> bool {
        self.total_events > self.members.len() as u64
    }
}

/// Working set of entries for one build/persist round
#[derive(Debug, Default)]
pub struct IndexMaps {
    pub entries: BTreeMap<String, IndexEntry>,
    pub lookups: BTreeMap<String, SignalLookup>,
    dirty: BTreeSet<String>,
}

impl IndexMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with an entry read back from the store (not dirty)
    pub fn insert_loaded(&mut self, key: String, entry: IndexEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Keys of entries changed since they were loaded
    pub fn dirty_keys(&self) -> impl Iterator<Item = &String> {
        self.dirty.iter()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub events_seen: u64,
    pub memberships_added: u64,
    pub duplicates_skipped: u64,
    pub entries_created: u64,
    pub entries_touched: u64,
    pub lookups_refreshed: u64,
}

/// Facet values an event is indexed under
pub fn facet_values(event: &Event) -> Vec<(Facet, String)> {
    let mut values = Vec::with_capacity(9);
    if let Some(ip) = &event.signals.ip {
        values.push((Facet::Ip, ip.clone()));
    }
    if let Some(session) = &event.signals.session_id {
        values.push((Facet::Session, session.clone()));
    }
    if let Some(page) = event.normalized_page() {
        values.push((Facet::LandingPage, page));
    }
    values.push((Facet::Source, event.traffic_source()));
    values.push((Facet::Date, event.date_key()));
    if let Some(email) = &event.email {
        values.push((Facet::Email, email.trim().to_lowercase()));
    }
    if let Some(device) = &event.signals.device_signature {
        values.push((Facet::Device, device.clone()));
        for token in device_tokens(device) {
            values.push((Facet::Device, token.to_string()));
        }
    }
    if let Some(screen) = event.screen_hash() {
        values.push((Facet::Screen, screen));
    }
    if let Some(gpu) = event.gpu_hash() {
        values.push((Facet::Gpu, gpu));
    }
    values
}

/// Components of a composite device fingerprint (`ua=..|canvas=..;tz=..`),
/// each indexed on its own so a query holding one component finds a lookup
pub fn device_tokens(signature: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = Vec::new();
    for token in signature.split(['|', ';']).map(str::trim) {
        if !token.is_empty() && token != signature.trim() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Every index key a batch of events will touch; load these before building
pub fn touched_index_keys(events: &[Event]) -> BTreeSet<String> {
    events
        .iter()
        .flat_map(facet_values)
        .map(|(facet, value)| index_key(facet, &value))
        .collect()
}

pub struct IndexBuilder {
    ttl: Duration,
    lookup_cap: usize,
}

impl IndexBuilder {
    pub fn new(ttl_days: i64, lookup_cap: usize) -> Self {
        Self {
            ttl: Duration::days(ttl_days),
            lookup_cap: lookup_cap.max(1),
        }
    }

    pub fn build(&self, events: &[Event], maps: &mut IndexMaps) -> BuildStats {
        self.build_at(events, maps, Utc::now())
    }

    /// Merge `events` into `maps`. Re-running with the same events adds nothing.
    pub fn build_at(&self, events: &[Event], maps: &mut IndexMaps, now: DateTime<Utc>) -> BuildStats {
        let mut stats = BuildStats::default();
        let mut changed: BTreeSet<String> = BTreeSet::new();

        for event in events {
            stats.events_seen += 1;
            for (facet, value) in facet_values(event) {
                let key = index_key(facet, &value);
                let entry = maps.entries.entry(key.clone()).or_insert_with(|| {
                    stats.entries_created += 1;
                    IndexEntry::new(facet, &value, now)
                });

                if entry.insert(event) {
                    stats.memberships_added += 1;
                    changed.insert(key);
                } else {
                    stats.duplicates_skipped += 1;
                }
            }
        }

        for key in &changed {
            let Some(entry) = maps.entries.get_mut(key) else {
                continue;
            };
            entry.refresh(now, self.ttl);

            if entry.facet.is_identity_signal() {
                let lookup = SignalLookup::from_entry(entry, self.lookup_cap);
                maps.lookups.insert(lookup_key(entry.facet, &entry.value), lookup);
                stats.lookups_refreshed += 1;
            }
        }

        stats.entries_touched = changed.len() as u64;
        maps.dirty.extend(changed);

        log::debug!(
            "📊 Index build: {} events, {} memberships added, {} duplicates, {} entries touched",
            stats.events_seen,
            stats.memberships_added,
            stats.duplicates_skipped,
            stats.entries_touched
        );
        stats
    }
}
