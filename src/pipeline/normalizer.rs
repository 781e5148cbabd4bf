//! Pageview normalization from raw stored records to the canonical Event
//!
//! Upstream writers disagree on field names (at least six spellings of "IP")
//! and on encoding (plain JSON, percent-encoded JSON, JSON wrapped in a JSON
//! string). All of that is resolved here, once, through the alias table; past
//! this module only [`Event`] exists.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

/// Field aliases per canonical field, in precedence order
mod aliases {
    pub const TIMESTAMP: &[&str] = &["timestamp", "ts", "created_at", "createdAt", "time", "visited_at"];
    pub const IP: &[&str] = &[
        "ip",
        "ip_address",
        "ipAddress",
        "client_ip",
        "clientIp",
        "visitor_ip",
        "x_forwarded_for",
        "remote_addr",
    ];
    pub const SESSION: &[&str] = &["session_id", "sessionId", "sid", "session"];
    pub const DEVICE: &[&str] = &[
        "device_signature",
        "deviceSignature",
        "device_fingerprint",
        "canvas_fingerprint",
        "canvasFingerprint",
        "fingerprint",
    ];
    pub const SCREEN: &[&str] = &["screen_signature", "screenSignature", "screen_resolution", "screenResolution", "screen"];
    pub const GPU: &[&str] = &["gpu_signature", "gpuSignature", "webgl_signature", "webgl_renderer", "webglRenderer", "gpu"];
    pub const LANDING: &[&str] = &["landing_page", "landingPage", "page_url", "pageUrl", "url", "page"];
    pub const REFERRER: &[&str] = &["referrer", "referer", "document_referrer"];
    pub const EMAIL: &[&str] = &["email", "user_email", "userEmail"];
    pub const SOURCE: &[&str] = &["utm_source", "utmSource", "source"];
    pub const CAMPAIGN: &[&str] = &["utm_campaign", "utmCampaign", "campaign"];
    pub const MEDIUM: &[&str] = &["utm_medium", "utmMedium", "medium"];
    pub const TERM: &[&str] = &["utm_term", "utmTerm", "term"];
    pub const CONTENT: &[&str] = &["utm_content", "utmContent", "content"];

    /// Nested objects some writers tuck fields into
    pub const CONTAINERS: &[&str] = &["data", "properties", "signals", "fingerprints", "utm"];
}

/// Placeholder strings writers used instead of leaving a field out
const NULLISH: &[&str] = &["", "null", "undefined", "unknown", "none", "n/a"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_signature: Option<String>,
}

impl IdentitySignals {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none()
            && self.session_id.is_none()
            && self.device_signature.is_none()
            && self.screen_signature.is_none()
            && self.gpu_signature.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One touchpoint (pageview), immutable once written upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signals: IdentitySignals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    #[serde(default)]
    pub utm: Utm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub store_key: String,
}

impl Event {
    /// Landing page reduced to `host/path` form used as the facet value
    pub fn normalized_page(&self) -> Option<String> {
        self.landing_page.as_deref().map(normalize_page)
    }

    /// utm_source, else the referrer host, else "direct"
    pub fn traffic_source(&self) -> String {
        if let Some(source) = &self.utm.source {
            return source.trim().to_lowercase();
        }
        if let Some(referrer) = &self.referrer {
            let (host, _) = split_url(referrer);
            if !host.is_empty() {
                return host;
            }
        }
        "direct".to_string()
    }

    /// Calendar date (UTC) of the visit
    pub fn date_key(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    pub fn screen_hash(&self) -> Option<String> {
        self.signals.screen_signature.as_deref().map(signature_hash)
    }

    pub fn gpu_hash(&self) -> Option<String> {
        self.signals.gpu_signature.as_deref().map(signature_hash)
    }

    /// Session id, else IP: the identity half of the dedup key
    pub fn identity_key(&self) -> &str {
        self.signals
            .session_id
            .as_deref()
            .or(self.signals.ip.as_deref())
            .unwrap_or(&self.store_key)
    }
}

#[derive(Debug)]
pub enum ParseError {
    Decode(String),
    NotAnObject,
    MissingTimestamp,
    InvalidTimestamp(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Decode(e) => write!(f, "Undecodable record: {}", e),
            ParseError::NotAnObject => write!(f, "Record is not a JSON object"),
            ParseError::MissingTimestamp => write!(f, "Record has no timestamp"),
            ParseError::InvalidTimestamp(v) => write!(f, "Unparseable timestamp: {}", v),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decode a stored value in any of the accepted encodings into a JSON object
pub fn decode_record(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let trimmed = raw.trim();

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => v,
        Err(first) => {
            let decoded = urlencoding::decode(trimmed)
                .map_err(|e| ParseError::Decode(format!("{} / {}", first, e)))?;
            serde_json::from_str::<Value>(decoded.trim())
                .map_err(|e| ParseError::Decode(format!("{} / {}", first, e)))?
        }
    };

    match value {
        Value::Object(obj) => Ok(obj),
        // Double-serialized: a JSON string holding JSON (possibly percent-encoded)
        Value::String(inner) if inner.trim_start().starts_with('{') || inner.contains("%7B") => {
            decode_record(&inner)
        }
        _ => Err(ParseError::NotAnObject),
    }
}

/// Parse a raw stored value into a canonical Event
pub fn parse_event(store_key: &str, raw: &str) -> Result<Event, ParseError> {
    let obj = decode_record(raw)?;

    let timestamp = match lookup(&obj, aliases::TIMESTAMP) {
        Some(v) => parse_timestamp(v)?,
        None => return Err(ParseError::MissingTimestamp),
    };

    let signals = IdentitySignals {
        ip: text(&obj, aliases::IP).map(|ip| normalize_ip(&ip)),
        session_id: text(&obj, aliases::SESSION),
        device_signature: text(&obj, aliases::DEVICE),
        screen_signature: text(&obj, aliases::SCREEN),
        gpu_signature: text(&obj, aliases::GPU),
    };

    let utm = Utm {
        source: text(&obj, aliases::SOURCE),
        campaign: text(&obj, aliases::CAMPAIGN),
        medium: text(&obj, aliases::MEDIUM),
        term: text(&obj, aliases::TERM),
        content: text(&obj, aliases::CONTENT),
    };

    Ok(Event {
        timestamp,
        signals,
        landing_page: text(&obj, aliases::LANDING),
        utm,
        referrer: text(&obj, aliases::REFERRER),
        email: text(&obj, aliases::EMAIL).map(|e| e.to_lowercase()),
        store_key: store_key.to_string(),
    })
}

fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    let direct = names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !is_nullish(v));
    if direct.is_some() {
        return direct;
    }
    aliases::CONTAINERS
        .iter()
        .filter_map(|c| obj.get(*c).and_then(Value::as_object))
        .flat_map(|inner| names.iter().filter_map(move |n| inner.get(*n)))
        .find(|v| !is_nullish(v))
}

fn text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match lookup(obj, names)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_nullish(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => NULLISH.contains(&s.trim().to_lowercase().as_str()),
        _ => false,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC), and epoch seconds or
/// milliseconds as number or numeric string
pub fn parse_timestamp(v: &Value) -> Result<DateTime<Utc>, ParseError> {
    let invalid = || ParseError::InvalidTimestamp(v.to_string());

    match v {
        Value::Number(n) => {
            let raw = n.as_f64().ok_or_else(invalid)?;
            epoch_to_utc(raw).ok_or_else(invalid)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            let raw: f64 = s.parse().map_err(|_| invalid())?;
            epoch_to_utc(raw).ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

/// Values above 1e11 are taken as milliseconds (1e11 s is the year 5138)
fn epoch_to_utc(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let millis = if raw > 1e11 { raw } else { raw * 1000.0 };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// First address of a forwarded-for chain; IPv6 lower-cased
pub fn normalize_ip(raw: &str) -> String {
    raw.split(',')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_lowercase()
}

/// Split a URL or path into (lower-cased host, path without query/fragment).
///
/// Port and userinfo never reach the host. Scheme-less values are read as
/// `http://`; values starting with a single `/` are bare paths.
pub fn split_url(raw: &str) -> (String, String) {
    let raw = raw.trim();
    let bare_path = || {
        raw.split(['?', '#'])
            .next()
            .unwrap_or(raw)
            .to_string()
    };
    if raw.starts_with('/') && !raw.starts_with("//") {
        return (String::new(), bare_path());
    }

    let absolute = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw.trim_start_matches('/'))
    };
    match Url::parse(&absolute) {
        Ok(url) => (
            url.host_str().unwrap_or_default().to_lowercase(),
            url.path().to_string(),
        ),
        Err(e) => {
            log::debug!("Unparseable URL {:?}: {}", raw, e);
            (String::new(), bare_path())
        }
    }
}

/// Canonical `host/path` form of a landing page; the site root alone is `/`
pub fn normalize_page(url: &str) -> String {
    let (host, path) = split_url(url);
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let page = format!("{}{}", host, path.trim_end_matches('/'));
    if page.is_empty() {
        "/".to_string()
    } else {
        page
    }
}

/// Truncated SHA-256 of a trimmed, lower-cased signature (32 hex chars)
pub fn signature_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.trim().to_lowercase().as_bytes());
    hex::encode(&digest[..16])
}
