//! End-to-end attribution: raw pageviews are indexed by the batch job, then
//! conversions are matched against the resulting indexes.

#[cfg(test)]
mod attribution_scenarios {
    use attribflow::api::{AttributionRequest, JobRequest};
    use attribflow::attribution::{
        AttributionQuery, AttributionService, ConfidenceWeights, LookupPath, MatchMode, Matcher,
    };
    use attribflow::pipeline::{IndexJob, JobSettings};
    use attribflow::store::{KvStore, MemoryStore, SqliteStore};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn conversion_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    async fn index_all(store: Arc<dyn KvStore>, records: &[(&str, &str)]) {
        for (key, raw) in records {
            store.set(key, raw, None).await.unwrap();
        }
        let job = IndexJob::new(store, JobSettings::default());
        let report = job.run(&JobRequest::default()).await.unwrap();
        assert!(report.is_complete, "index job did not finish: {:?}", report);
        assert!(report.failed_chunk.is_none());
    }

    fn create_test_request() -> AttributionRequest {
        AttributionRequest {
            conversion_timestamp: conversion_time(),
            ips_to_check: Vec::new(),
            conversion_ip: None,
            session_id: None,
            device_signature: None,
            screen_value: None,
            gpu_signature: None,
            window_hours: Some(24),
            conversion_id: Some("purchase:1001".to_string()),
            conversion_value: None,
        }
    }

    fn create_test_service(store: Arc<dyn KvStore>) -> AttributionService {
        AttributionService::new(store, ConfidenceWeights::default(), 24, 168, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn test_session_match_scores_300() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        index_all(
            store.clone(),
            &[(
                "pageview:a1",
                r#"{"timestamp":"2025-07-01T10:00:00Z","session_id":"S1","ip":"198.51.100.4","page_url":"https://example.com/pricing"}"#,
            )],
        )
        .await;

        let mut request = create_test_request();
        request.session_id = Some("S1".to_string());
        let response = create_test_service(store).attribute(&request).await.unwrap();

        assert!(response.found);
        assert_eq!(response.matches_found.len(), 1);
        let best = response.best_match.unwrap();
        assert_eq!(best.attribution_method, "session_id_match");
        assert_eq!(best.confidence, 300);
        assert_eq!(response.lookup_path, Some(LookupPath::Primary));
    }

    #[tokio::test]
    async fn test_second_ip_scores_240_not_280() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        index_all(
            store.clone(),
            &[(
                "pageview:b1",
                r#"{"timestamp":"2025-07-01T11:00:00Z","ipAddress":"203.0.113.8"}"#,
            )],
        )
        .await;

        let mut request = create_test_request();
        request.ips_to_check = vec!["192.0.2.1".to_string(), "203.0.113.8".to_string()];
        let response = create_test_service(store).attribute(&request).await.unwrap();

        let best = response.best_match.unwrap();
        assert_eq!(best.confidence, 240);
        assert_eq!(best.attribution_method, "ip_fallback_match");
    }

    #[tokio::test]
    async fn test_window_start_is_inclusive_to_the_millisecond() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        index_all(
            store.clone(),
            &[
                (
                    "pageview:c1",
                    r#"{"timestamp":"2025-06-30T11:59:59.999Z","session_id":"S9"}"#,
                ),
                (
                    "pageview:c2",
                    r#"{"timestamp":"2025-06-30T12:00:00.000Z","session_id":"S9"}"#,
                ),
                (
                    "pageview:c3",
                    r#"{"timestamp":"2025-07-01T12:00:00.001Z","session_id":"S9"}"#,
                ),
            ],
        )
        .await;

        let matcher = Matcher::new(store, ConfidenceWeights::default());
        let query = AttributionQuery::new(conversion_time()).with_session("S9");
        let report = matcher.find_matches(&query, MatchMode::Exhaustive).await.unwrap();

        let keys: Vec<&str> = report.matches.iter().map(|m| m.event.store_key.as_str()).collect();
        assert_eq!(keys, vec!["pageview:c2"]);
    }

    #[tokio::test]
    async fn test_ranked_by_confidence_then_recency() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        index_all(
            store.clone(),
            &[
                (
                    "pageview:d1",
                    r#"{"timestamp":"2025-07-01T08:00:00Z","session_id":"S2","ip":"10.1.1.1"}"#,
                ),
                (
                    "pageview:d2",
                    r#"{"timestamp":"2025-07-01T09:00:00Z","ip":"10.1.1.1"}"#,
                ),
                (
                    "pageview:d3",
                    r#"{"timestamp":"2025-07-01T10:00:00Z","ip":"10.1.1.1"}"#,
                ),
            ],
        )
        .await;

        let matcher = Matcher::new(store, ConfidenceWeights::default());
        let query = AttributionQuery::new(conversion_time())
            .with_session("S2")
            .with_ips(["10.1.1.1"]);
        let report = matcher.find_matches(&query, MatchMode::Exhaustive).await.unwrap();

        let ranked: Vec<(&str, u32)> = report
            .matches
            .iter()
            .map(|m| (m.event.store_key.as_str(), m.confidence))
            .collect();
        // d1 matched both tiers and keeps only its session score
        assert_eq!(
            ranked,
            vec![("pageview:d1", 300), ("pageview:d3", 280), ("pageview:d2", 280)]
        );
        for pair in report.matches.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[tokio::test]
    async fn test_missing_index_is_not_found() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut request = create_test_request();
        request.session_id = Some("ghost".to_string());
        request.ips_to_check = vec!["192.0.2.200".to_string()];

        let response = create_test_service(store).attribute(&request).await.unwrap();
        assert!(!response.found);
        assert!(response.matches_found.is_empty());
        assert!(response.lookup_path.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(dir.path().join("kv.db")).unwrap());
        index_all(
            store.clone(),
            &[
                (
                    "pageview:e1",
                    r#"{"timestamp":"2025-07-01T07:00:00Z","session_id":"S3","url":"https://example.com/blog/intro","utm_source":"newsletter"}"#,
                ),
                (
                    "pageview:e2",
                    r#"{"timestamp":"2025-07-01T11:30:00Z","session_id":"S3","url":"https://example.com/checkout"}"#,
                ),
            ],
        )
        .await;

        let mut request = create_test_request();
        request.session_id = Some("S3".to_string());
        let service = create_test_service(store);

        let journey = service.journey(&request).await.unwrap();
        assert_eq!(journey.touchpoints.len(), 2);
        assert_eq!(journey.first_touch.as_ref().unwrap().source, "newsletter");
        assert_eq!(journey.last_touch.as_ref().unwrap().source, "direct");
        assert_eq!(journey.attribution_score, 300);

        let summary = service.journey_summary(&request).await.unwrap();
        assert_eq!(summary.touchpoint_count, 2);
        assert_eq!(summary.conversion_id, "purchase:1001");
    }

    // Test: a device signature known only in part matches the stored composite
    #[tokio::test]
    async fn test_device_fragment_matches_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(dir.path().join("kv.db")).unwrap());
        index_all(
            store.clone(),
            &[(
                "pageview:f1",
                r#"{"timestamp":"2025-07-01T09:00:00Z","device_signature":"ua=x|canvas=abc123|tz=utc"}"#,
            )],
        )
        .await;
        let service = create_test_service(store);

        for fragment in ["canvas=abc123", "abc12"] {
            let mut request = create_test_request();
            request.device_signature = Some(fragment.to_string());
            let response = service.attribute(&request).await.unwrap();
            assert!(response.found, "no match for {}", fragment);
            let best = response.best_match.unwrap();
            assert_eq!(best.confidence, 260);
            assert_eq!(best.attribution_method, "device_signature_match");
            assert_eq!(response.lookup_path, Some(LookupPath::Primary));
        }
    }
}
