//! Attribution entry points: ranked matches and journeys

use super::cache::{fingerprint, JourneyCache};
use super::confidence::ConfidenceWeights;
use super::journey::{ConversionInfo, Journey, JourneyBuilder, JourneySummary};
use super::matcher::{MatchMode, Matcher, MatchReport};
use crate::api::{AttributionRequest, AttributionResponse};
use crate::store::{KvStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

pub struct AttributionService {
    matcher: Matcher,
    builder: JourneyBuilder,
    cache: JourneyCache,
    default_window_hours: i64,
    journey_lookback_hours: i64,
}

impl AttributionService {
    pub fn new(
        store: Arc<dyn KvStore>,
        weights: ConfidenceWeights,
        default_window_hours: i64,
        journey_lookback_hours: i64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            matcher: Matcher::new(store.clone(), weights),
            builder: JourneyBuilder::new(),
            cache: JourneyCache::new(store, cache_ttl),
            default_window_hours,
            journey_lookback_hours,
        }
    }

    /// Best-tier matches inside the request's window
    pub async fn attribute(&self, request: &AttributionRequest) -> Result<AttributionResponse, StoreError> {
        let query = request.to_query(self.default_window_hours);
        if !query.has_signals() {
            log::warn!("⚠️  Attribution request carries no signals");
        }
        let report = self.matcher.find_matches(&query, MatchMode::BestTier).await?;

        match report.best() {
            Some(best) => log::info!(
                "✅ Attributed {} to {} ({})",
                request.conversion_timestamp,
                best.event.store_key,
                best.attribution_method
            ),
            None => log::info!("❌ No attribution for {}", request.conversion_timestamp),
        }
        Ok(AttributionResponse::from(&report))
    }

    async fn collect_journey_matches(&self, request: &AttributionRequest) -> Result<MatchReport, StoreError> {
        let query = request
            .to_query(self.default_window_hours)
            .with_window_hours(self.journey_lookback_hours);
        self.matcher.find_matches(&query, MatchMode::Exhaustive).await
    }

    /// Full journey over the lookback; refreshes the cached summary
    pub async fn journey(&self, request: &AttributionRequest) -> Result<Journey, StoreError> {
        let conversion = request.conversion_info();
        let report = self.collect_journey_matches(request).await?;
        let journey = self.builder.build(&report.matches, &conversion);

        let summary = journey.summary(&fingerprint(&report.matches));
        if let Err(e) = self.cache.put(&summary).await {
            if e.is_fatal() {
                return Err(e);
            }
            log::warn!("⚠️  Could not cache journey {}: {}", conversion.id, e);
        }
        Ok(journey)
    }

    /// Journey summary, served from cache while the member set is unchanged
    pub async fn journey_summary(&self, request: &AttributionRequest) -> Result<JourneySummary, StoreError> {
        let conversion: ConversionInfo = request.conversion_info();
        let report = self.collect_journey_matches(request).await?;
        let fp = fingerprint(&report.matches);

        if let Some(cached) = self.cache.get_fresh(&conversion.id, &fp).await? {
            log::debug!("📦 Journey cache hit for {}", conversion.id);
            return Ok(cached);
        }

        let summary = self.builder.build(&report.matches, &conversion).summary(&fp);
        if let Err(e) = self.cache.put(&summary).await {
            if e.is_fatal() {
                return Err(e);
            }
            log::warn!("⚠️  Could not cache journey {}: {}", conversion.id, e);
        }
        Ok(summary)
    }
}
