//! Wire shapes for the job trigger and the attribution query
//!
//! These are the JSON bodies the binaries read and print. Internal types stay
//! free to change; these only grow optional fields.

use crate::attribution::confidence::{LookupPath, Tier};
use crate::attribution::journey::ConversionInfo;
use crate::attribution::matcher::{MatchReport, MatchResult};
use crate::attribution::query::AttributionQuery;
use crate::pipeline::job::JobReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trigger for one index-job invocation; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub pattern: Option<String>,
    /// Keys examined per scan call
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Resume from here instead of the stored cursor
    #[serde(default)]
    pub start_cursor: Option<String>,
    /// Only index events newer than this many hours
    #[serde(default)]
    pub window_hours: Option<i64>,
    /// Start a new completion cycle
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub budget_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub pageviews_extracted_this_run: u64,
    pub final_cursor: String,
    pub is_complete: bool,
    pub keys_scanned: u64,
    pub parse_failures: u64,
    pub entries_written: usize,
    pub entries_deferred: usize,
    pub failed_chunk: Option<String>,
    pub elapsed_ms: u64,
    pub rounds: usize,
    pub cycle: u64,
}

impl From<&JobReport> for JobResponse {
    fn from(r: &JobReport) -> Self {
        Self {
            pageviews_extracted_this_run: r.pageviews_extracted,
            final_cursor: r.final_cursor.clone(),
            is_complete: r.is_complete,
            keys_scanned: r.keys_scanned,
            parse_failures: r.parse_failures,
            entries_written: r.entries_written,
            entries_deferred: r.entries_deferred,
            failed_chunk: r.failed_chunk.clone(),
            elapsed_ms: r.elapsed.as_millis() as u64,
            rounds: r.rounds,
            cycle: r.cycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRequest {
    pub conversion_timestamp: DateTime<Utc>,
    /// Priority order: the first is the primary IP
    #[serde(default)]
    pub ips_to_check: Vec<String>,
    #[serde(default)]
    pub conversion_ip: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub device_signature: Option<String>,
    #[serde(default)]
    pub screen_value: Option<String>,
    #[serde(default)]
    pub gpu_signature: Option<String>,
    #[serde(default)]
    pub window_hours: Option<i64>,
    /// Needed only for journey requests
    #[serde(default)]
    pub conversion_id: Option<String>,
    #[serde(default)]
    pub conversion_value: Option<f64>,
}

impl AttributionRequest {
    pub fn to_query(&self, default_window_hours: i64) -> AttributionQuery {
        AttributionQuery {
            conversion_time: self.conversion_timestamp,
            window_hours: self.window_hours.unwrap_or(default_window_hours),
            session_id: self.session_id.clone(),
            device_signature: self.device_signature.clone(),
            ips: self.ips_to_check.clone(),
            conversion_ip: self.conversion_ip.clone(),
            screen_value: self.screen_value.clone(),
            gpu_signature: self.gpu_signature.clone(),
        }
    }

    pub fn conversion_info(&self) -> ConversionInfo {
        ConversionInfo {
            id: self
                .conversion_id
                .clone()
                .unwrap_or_else(|| format!("conversion-{}", self.conversion_timestamp.timestamp_millis())),
            timestamp: self.conversion_timestamp,
            value: self.conversion_value,
            email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchView {
    pub attribution_method: String,
    pub tier: Tier,
    pub lookup_path: LookupPath,
    pub confidence: u32,
    pub timestamp: DateTime<Utc>,
    pub store_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    pub source: String,
}

impl From<&MatchResult> for MatchView {
    fn from(m: &MatchResult) -> Self {
        Self {
            attribution_method: m.attribution_method.label(),
            tier: m.attribution_method.tier,
            lookup_path: m.attribution_method.path,
            confidence: m.confidence,
            timestamp: m.event.timestamp,
            store_key: m.event.store_key.clone(),
            ip: m.event.signals.ip.clone(),
            session_id: m.event.signals.session_id.clone(),
            landing_page: m.event.landing_page.clone(),
            source: m.event.traffic_source(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionResponse {
    pub matches_found: Vec<MatchView>,
    pub best_match: Option<MatchView>,
    pub found: bool,
    pub lookup_path: Option<LookupPath>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl From<&MatchReport> for AttributionResponse {
    fn from(report: &MatchReport) -> Self {
        let matches_found: Vec<MatchView> = report.matches.iter().map(MatchView::from).collect();
        Self {
            best_match: matches_found.first().cloned(),
            found: !matches_found.is_empty(),
            matches_found,
            lookup_path: report.path,
            window_start: report.window_start,
            window_end: report.window_end,
        }
    }
}
