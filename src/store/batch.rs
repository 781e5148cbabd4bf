//! Bounded fan-out over the store
//!
//! Calls go out in groups of at most `concurrency` in flight. Results come back
//! in input order regardless of completion order.

use super::{KvStore, StoreError};
use futures::stream::{self, StreamExt};
use std::time::Duration;

/// Fetch many keys; each slot carries its own result so one failure does not
/// hide the values that did arrive
pub async fn get_many(
    store: &dyn KvStore,
    keys: &[String],
    concurrency: usize,
) -> Vec<Result<Option<String>, StoreError>> {
    let mut results: Vec<(usize, Result<Option<String>, StoreError>)> =
        stream::iter(keys.iter().enumerate())
            .map(|(i, key)| async move { (i, store.get(key).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    // Restore order (buffer_unordered may complete out of order)
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

/// Write many key/value pairs with a shared TTL, returns per-pair results
pub async fn set_many(
    store: &dyn KvStore,
    pairs: &[(String, String)],
    ttl: Option<Duration>,
    concurrency: usize,
) -> Vec<Result<(), StoreError>> {
    let mut results: Vec<(usize, Result<(), StoreError>)> = stream::iter(pairs.iter().enumerate())
        .map(|(i, (key, value))| async move { (i, store.set(key, value, ttl).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let store = MemoryStore::new();
        for i in 0..40 {
            store.set(&format!("k{}", i), &i.to_string(), None).await.unwrap();
        }

        let keys: Vec<String> = (0..45).rev().map(|i| format!("k{}", i)).collect();
        let values = get_many(&store, &keys, 8).await;

        assert_eq!(values.len(), 45);
        // k44..k40 are missing, then k39 down to k0
        assert!(values[..5].iter().all(|v| matches!(v, Ok(None))));
        assert_eq!(values[5].as_ref().unwrap().as_deref(), Some("39"));
        assert_eq!(values[44].as_ref().unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_set_many_writes_everything() {
        let store = MemoryStore::new();
        let pairs: Vec<(String, String)> = (0..30)
            .map(|i| (format!("idx:{}", i), format!("v{}", i)))
            .collect();

        let results = set_many(&store, &pairs, None, 25).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(store.len(), 30);
    }
}
