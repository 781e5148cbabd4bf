//! Hosted key-value store over its REST command endpoint
//!
//! Each command is a JSON array POSTed to the base URL, e.g.
//! `["SCAN", "0", "MATCH", "pageview:*", "COUNT", "200"]`, answered with
//! `{"result": ...}` or `{"error": "..."}`.

use super::{KvStore, ScanPage, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CommandResponse {
    result: Option<Value>,
    error: Option<String>,
}

pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, args: Value) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(StoreError::Unauthorized(format!("HTTP {}", status)));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StoreError::Unavailable(format!("HTTP {}", status)));
        }

        let body: CommandResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(StoreError::Protocol(error));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

/// Decode the `[cursor, [keys...]]` shape a SCAN answers with
fn parse_scan_result(result: Value) -> Result<ScanPage, StoreError> {
    let parts = match result {
        Value::Array(parts) if parts.len() == 2 => parts,
        other => {
            return Err(StoreError::Protocol(format!(
                "unexpected SCAN result: {}",
                other
            )))
        }
    };

    let next_cursor = match &parts[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(StoreError::Protocol(format!(
                "unexpected SCAN cursor: {}",
                other
            )))
        }
    };

    let keys = match &parts[1] {
        Value::Array(keys) => keys
            .iter()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect(),
        other => {
            return Err(StoreError::Protocol(format!(
                "unexpected SCAN keys: {}",
                other
            )))
        }
    };

    Ok(ScanPage { next_cursor, keys })
}

#[async_trait]
impl KvStore for RestStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(json!(["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            // Some writers stored bare JSON which the endpoint hands back decoded
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let args = match ttl {
            Some(ttl) => json!(["SET", key, value, "EX", ttl.as_secs().max(1).to_string()]),
            None => json!(["SET", key, value]),
        };
        self.command(args).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let result = self
            .command(json!([
                "SCAN",
                cursor,
                "MATCH",
                pattern,
                "COUNT",
                count.max(1).to_string()
            ]))
            .await?;
        parse_scan_result(result)
    }

    fn backend_type(&self) -> &'static str {
        "REST"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_result_string_cursor() {
        let page = parse_scan_result(json!(["1792", ["pageview:1", "pageview:2"]])).unwrap();
        assert_eq!(page.next_cursor, "1792");
        assert_eq!(page.keys.len(), 2);
    }

    #[test]
    fn test_parse_scan_result_numeric_terminal_cursor() {
        let page = parse_scan_result(json!([0, []])).unwrap();
        assert!(page.is_terminal());
        assert!(page.keys.is_empty());
    }

    #[test]
    fn test_parse_scan_result_rejects_garbage() {
        assert!(parse_scan_result(json!("OK")).is_err());
        assert!(parse_scan_result(json!(["0", "oops"])).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let store = RestStore::new("http://127.0.0.1:9", "token", Duration::from_millis(200)).unwrap();
        let err = store.get("anything").await.unwrap_err();
        assert!(!err.is_fatal());
    }
}
