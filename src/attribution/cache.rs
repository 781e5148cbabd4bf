//! Journey summary cache
//!
//! Summaries live under `cache:journey:<conversion id>` with a TTL. Each one
//! carries a fingerprint of the member events it was built from; a summary
//! whose fingerprint no longer matches the current members is stale.

use super::journey::JourneySummary;
use super::matcher::MatchResult;
use crate::store::keyspace::journey_cache_key;
use crate::store::{KvStore, StoreError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Order-independent digest of the matched store keys
pub fn fingerprint(matches: &[MatchResult]) -> String {
    let mut keys: Vec<&str> = matches.iter().map(|m| m.event.store_key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

pub struct JourneyCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl JourneyCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Cached summary, only if it was built from the same members
    pub async fn get_fresh(
        &self,
        conversion_id: &str,
        fingerprint: &str,
    ) -> Result<Option<JourneySummary>, StoreError> {
        let key = journey_cache_key(conversion_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<JourneySummary>(&raw) {
            Ok(summary) if summary.fingerprint == fingerprint => Ok(Some(summary)),
            Ok(_) => {
                log::debug!("♻️  Journey cache for {} is stale", conversion_id);
                Ok(None)
            }
            Err(e) => {
                log::warn!("⚠️  Unreadable journey cache {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn put(&self, summary: &JourneySummary) -> Result<(), StoreError> {
        let key = journey_cache_key(&summary.conversion_id);
        let payload = serde_json::to_string(summary)?;
        self.store.set(&key, &payload, Some(self.ttl)).await
    }

    pub async fn invalidate(&self, conversion_id: &str) -> Result<(), StoreError> {
        self.store.delete(&journey_cache_key(conversion_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::confidence::{AttributionMethod, Tier};
    use crate::attribution::journey::{ConversionInfo, JourneyBuilder};
    use crate::pipeline::normalizer::{Event, IdentitySignals, Utm};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn create_test_match(key: &str, minute: u32) -> MatchResult {
        MatchResult {
            event: Event {
                timestamp: Utc.with_ymd_and_hms(2025, 7, 1, 10, minute, 0).unwrap(),
                signals: IdentitySignals::default(),
                landing_page: None,
                utm: Utm::default(),
                referrer: None,
                email: None,
                store_key: key.to_string(),
            },
            attribution_method: AttributionMethod::primary(Tier::IpPrimary),
            confidence: 280,
        }
    }

    fn conversion() -> ConversionInfo {
        ConversionInfo {
            id: "purchase:7".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap(),
            value: None,
            email: None,
        }
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = vec![create_test_match("pageview:1", 0), create_test_match("pageview:2", 1)];
        let b = vec![create_test_match("pageview:2", 1), create_test_match("pageview:1", 0)];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&a[..1]));
    }

    #[tokio::test]
    async fn test_cache_hit_and_stale() {
        let cache = JourneyCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let matches = vec![create_test_match("pageview:1", 0)];
        let fp = fingerprint(&matches);

        let summary = JourneyBuilder::new().build(&matches, &conversion()).summary(&fp);
        cache.put(&summary).await.unwrap();

        let hit = cache.get_fresh("purchase:7", &fp).await.unwrap();
        assert_eq!(hit.unwrap().touchpoint_count, 1);

        // A newly indexed event changes the fingerprint
        let grown = vec![create_test_match("pageview:1", 0), create_test_match("pageview:9", 5)];
        assert!(cache.get_fresh("purchase:7", &fingerprint(&grown)).await.unwrap().is_none());

        cache.invalidate("purchase:7").await.unwrap();
        assert!(cache.get_fresh("purchase:7", &fp).await.unwrap().is_none());
    }
}
