//! Index persistence with per-facet time shares
//!
//! Entries are written facet group by facet group, each group bounded by a
//! cumulative slice of the remaining budget:
//!
//! | Group       | Share | Facets                                   |
//! |-------------|-------|------------------------------------------|
//! | IP          | 40%   | ip                                       |
//! | Session     | 20%   | session                                  |
//! | Landing     | 20%   | landing                                  |
//! | Source      | 20%   | source                                   |
//! | Auxiliary   | rest  | date, email, device, screen, gpu, lookups|
//!
//! Time an early group leaves unused carries into the later ones. Writes not
//! started before their group's cutoff are reported as deferred.

use super::deadline::Deadline;
use super::index::{IndexEntry, IndexMaps};
use crate::store::{batch, Facet, KvStore, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Cumulative shares for the four primary groups; the auxiliary group runs to
/// the overall deadline
pub const GROUP_SHARES: [f64; 4] = [0.4, 0.2, 0.2, 0.2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FacetGroup {
    Ip,
    Session,
    Landing,
    Source,
    Auxiliary,
}

impl FacetGroup {
    fn of(facet: Facet) -> Self {
        match facet {
            Facet::Ip => FacetGroup::Ip,
            Facet::Session => FacetGroup::Session,
            Facet::LandingPage => FacetGroup::Landing,
            Facet::Source => FacetGroup::Source,
            _ => FacetGroup::Auxiliary,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FacetGroup::Ip => "ip",
            FacetGroup::Session => "session",
            FacetGroup::Landing => "landing",
            FacetGroup::Source => "source",
            FacetGroup::Auxiliary => "auxiliary",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: usize,
    /// Stored entries that could not be decoded and will be rebuilt
    pub corrupt: usize,
    /// Keys whose read failed; writing them now could drop members
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    pub lookups_written: usize,
    pub deferred: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl PersistReport {
    /// Every dirty record made it to the store
    pub fn is_complete(&self) -> bool {
        self.deferred == 0 && self.failed == 0
    }
}

pub struct IndexPersister {
    store: Arc<dyn KvStore>,
    write_batch_size: usize,
    ttl: Option<Duration>,
}

impl IndexPersister {
    pub fn new(store: Arc<dyn KvStore>, write_batch_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            store,
            write_batch_size: write_batch_size.max(1),
            ttl,
        }
    }

    /// Read back stored entries for `keys` so the builder can merge into them
    pub async fn load_existing(
        &self,
        keys: &BTreeSet<String>,
        maps: &mut IndexMaps,
    ) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::default();
        let keys: Vec<String> = keys
            .iter()
            .filter(|k| maps.get(k).is_none())
            .cloned()
            .collect();

        for chunk in keys.chunks(self.write_batch_size) {
            let values = batch::get_many(self.store.as_ref(), chunk, self.write_batch_size).await;
            for (key, value) in chunk.iter().zip(values) {
                match value {
                    Ok(Some(raw)) => match IndexEntry::from_json(&raw) {
                        Ok(entry) => {
                            maps.insert_loaded(key.clone(), entry);
                            report.loaded += 1;
                        }
                        Err(e) => {
                            log::warn!("⚠️  Corrupt index entry {} will be rebuilt: {}", key, e);
                            report.corrupt += 1;
                        }
                    },
                    Ok(None) => report.missing += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::warn!("⚠️  Failed to load index entry {}: {}", key, e);
                        report.failed.push(key.clone());
                    }
                }
            }
        }

        log::debug!(
            "📥 Loaded {} existing entries ({} new, {} corrupt, {} failed)",
            report.loaded,
            report.missing,
            report.corrupt,
            report.failed.len()
        );
        Ok(report)
    }

    /// Write every dirty entry and refreshed lookup within `deadline`
    pub async fn persist(
        &self,
        maps: &IndexMaps,
        deadline: &Deadline,
    ) -> Result<PersistReport, StoreError> {
        let mut report = PersistReport::default();
        let slices = deadline.split_cumulative(&GROUP_SHARES);
        let groups = [
            (FacetGroup::Ip, slices[0]),
            (FacetGroup::Session, slices[1]),
            (FacetGroup::Landing, slices[2]),
            (FacetGroup::Source, slices[3]),
            (FacetGroup::Auxiliary, *deadline),
        ];

        for (group, group_deadline) in groups {
            let mut pairs = Vec::new();
            for key in maps.dirty_keys() {
                let Some(entry) = maps.get(key) else {
                    continue;
                };
                if FacetGroup::of(entry.facet) != group {
                    continue;
                }
                match entry.to_json() {
                    Ok(json) => pairs.push((key.clone(), json)),
                    Err(e) => {
                        log::warn!("⚠️  Failed to encode index entry {}: {}", key, e);
                        report.failed += 1;
                        report.last_error = Some(e.to_string());
                    }
                }
            }

            let written = self.write_group(group, &pairs, &group_deadline, &mut report).await?;
            report.written += written;

            if group == FacetGroup::Auxiliary {
                let mut lookups = Vec::with_capacity(maps.lookups.len());
                for (key, lookup) in &maps.lookups {
                    match serde_json::to_string(lookup) {
                        Ok(json) => lookups.push((key.clone(), json)),
                        Err(e) => {
                            report.failed += 1;
                            report.last_error = Some(e.to_string());
                        }
                    }
                }
                let written = self
                    .write_group(group, &lookups, &group_deadline, &mut report)
                    .await?;
                report.lookups_written += written;
            }
        }

        if report.is_complete() {
            log::info!(
                "💾 Persisted {} entries and {} lookups",
                report.written,
                report.lookups_written
            );
        } else {
            log::warn!(
                "⚠️  Partial persist: {} written, {} deferred, {} failed",
                report.written + report.lookups_written,
                report.deferred,
                report.failed
            );
        }
        Ok(report)
    }

    /// Write `pairs` in batches until done or out of time; returns the number written
    async fn write_group(
        &self,
        group: FacetGroup,
        pairs: &[(String, String)],
        deadline: &Deadline,
        report: &mut PersistReport,
    ) -> Result<usize, StoreError> {
        let mut written = 0;
        let mut attempted = 0;

        for chunk in pairs.chunks(self.write_batch_size) {
            if deadline.is_exhausted() {
                let left = pairs.len() - attempted;
                log::info!(
                    "⏱️  {} group out of time, deferring {} writes",
                    group.name(),
                    left
                );
                report.deferred += left;
                break;
            }

            let results = batch::set_many(self.store.as_ref(), chunk, self.ttl, self.write_batch_size).await;
            attempted += chunk.len();
            for ((key, _), result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => written += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::warn!("⚠️  Failed to write {}: {}", key, e);
                        report.failed += 1;
                        report.last_error = Some(e.to_string());
                    }
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::index::IndexBuilder;
    use crate::pipeline::normalizer::{Event, IdentitySignals, Utm};
    use crate::store::keyspace::{index_key, lookup_key};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn create_test_event(key: &str, secs: i64, ip: &str) -> Event {
        Event {
            timestamp: Utc.timestamp_opt(1_751_371_200 + secs, 0).unwrap(),
            signals: IdentitySignals {
                ip: Some(ip.to_string()),
                session_id: Some(format!("s-{}", key)),
                ..Default::default()
            },
            landing_page: Some("https://example.com/".to_string()),
            utm: Utm::default(),
            referrer: None,
            email: None,
            store_key: key.to_string(),
        }
    }

    fn built_maps(events: &[Event]) -> IndexMaps {
        let mut maps = IndexMaps::new();
        IndexBuilder::new(30, 100).build(events, &mut maps);
        maps
    }

    #[tokio::test]
    async fn test_persist_writes_entries_and_lookups() {
        let store = Arc::new(MemoryStore::new());
        let persister = IndexPersister::new(store.clone(), 25, None);
        let maps = built_maps(&[
            create_test_event("pageview:1", 0, "10.0.0.1"),
            create_test_event("pageview:2", 5, "10.0.0.1"),
        ]);

        let report = persister.persist(&maps, &Deadline::unbounded()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.written, maps.dirty_count());
        assert_eq!(report.lookups_written, maps.lookups.len());

        let raw = store.get(&index_key(Facet::Ip, "10.0.0.1")).await.unwrap().unwrap();
        let entry = IndexEntry::from_json(&raw).unwrap();
        assert_eq!(entry.len(), 2);
        assert!(entry.contains("pageview:2"));
        assert!(store.get(&lookup_key(Facet::Session, "s-pageview:1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_deadline_defers_everything() {
        let store = Arc::new(MemoryStore::new());
        let persister = IndexPersister::new(store.clone(), 25, None);
        let maps = built_maps(&[create_test_event("pageview:1", 0, "10.0.0.1")]);

        let report = persister.persist(&maps, &Deadline::expired()).await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.written, 0);
        assert_eq!(report.deferred, maps.dirty_count() + maps.lookups.len());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_existing_then_merge() {
        let store = Arc::new(MemoryStore::new());
        let persister = IndexPersister::new(store.clone(), 25, None);

        let first = [create_test_event("pageview:1", 0, "10.0.0.1")];
        persister
            .persist(&built_maps(&first), &Deadline::unbounded())
            .await
            .unwrap();

        let second = [create_test_event("pageview:2", 30, "10.0.0.1")];
        let mut maps = IndexMaps::new();
        let keys = crate::pipeline::index::touched_index_keys(&second);
        let loaded = persister.load_existing(&keys, &mut maps).await.unwrap();
        // ip, landing, source and date already exist; the session is new
        assert_eq!(loaded.loaded, 4);
        assert_eq!(loaded.missing, 1);

        IndexBuilder::new(30, 100).build(&second, &mut maps);
        persister.persist(&maps, &Deadline::unbounded()).await.unwrap();

        let raw = store.get(&index_key(Facet::Ip, "10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(IndexEntry::from_json(&raw).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_rebuilt() {
        let store = Arc::new(MemoryStore::new());
        let key = index_key(Facet::Ip, "10.0.0.9");
        store.set(&key, "{broken", None).await.unwrap();

        let persister = IndexPersister::new(store.clone(), 25, None);
        let mut keys = BTreeSet::new();
        keys.insert(key);
        let mut maps = IndexMaps::new();
        let report = persister.load_existing(&keys, &mut maps).await.unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(maps.is_empty());
    }
}
