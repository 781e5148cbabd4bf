//! Attribution query and window arithmetic

use super::confidence::Tier;
use crate::pipeline::normalizer::{normalize_ip, signature_hash};
use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Signals captured at conversion time
#[derive(Debug, Clone)]
pub struct AttributionQuery {
    pub conversion_time: DateTime<Utc>,
    pub window_hours: i64,
    pub session_id: Option<String>,
    pub device_signature: Option<String>,
    /// Caller-priority order; the first is the primary IP
    pub ips: Vec<String>,
    /// IP observed on the conversion request itself, if the caller knows it
    pub conversion_ip: Option<String>,
    pub screen_value: Option<String>,
    pub gpu_signature: Option<String>,
}

impl AttributionQuery {
    pub fn new(conversion_time: DateTime<Utc>) -> Self {
        Self {
            conversion_time,
            window_hours: DEFAULT_WINDOW_HOURS,
            session_id: None,
            device_signature: None,
            ips: Vec::new(),
            conversion_ip: None,
            screen_value: None,
            gpu_signature: None,
        }
    }

    pub fn with_window_hours(mut self, hours: i64) -> Self {
        self.window_hours = hours;
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_device(mut self, signature: &str) -> Self {
        self.device_signature = Some(signature.to_string());
        self
    }

    pub fn with_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ips = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_conversion_ip(mut self, ip: &str) -> Self {
        self.conversion_ip = Some(ip.to_string());
        self
    }

    pub fn with_screen(mut self, screen: &str) -> Self {
        self.screen_value = Some(screen.to_string());
        self
    }

    pub fn with_gpu(mut self, gpu: &str) -> Self {
        self.gpu_signature = Some(gpu.to_string());
        self
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.conversion_time - Duration::hours(self.window_hours.max(0))
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.conversion_time
    }

    /// Inclusive on both ends, compared at millisecond precision
    pub fn in_window(&self, ts: DateTime<Utc>) -> bool {
        let ms = ts.timestamp_millis();
        self.window_start().timestamp_millis() <= ms && ms <= self.window_end().timestamp_millis()
    }

    /// Normalized IPs with their tier, in the order they are tried.
    ///
    /// The first listed IP is primary, an explicit conversion IP comes next,
    /// and every other listed IP is a fallback. Duplicates keep their first
    /// (strongest) position.
    pub fn ip_candidates(&self) -> Vec<(String, Tier)> {
        let mut out: Vec<(String, Tier)> = Vec::new();
        let mut push = |raw: &str, tier: Tier| {
            let ip = normalize_ip(raw);
            if !ip.is_empty() && !out.iter().any(|(seen, _)| *seen == ip) {
                out.push((ip, tier));
            }
        };

        let mut listed = self.ips.iter();
        if let Some(first) = listed.next() {
            push(first, Tier::IpPrimary);
        }
        if let Some(ip) = &self.conversion_ip {
            push(ip, Tier::IpConversion);
        }
        for ip in listed {
            push(ip, Tier::IpFallback);
        }
        out
    }

    pub fn session(&self) -> Option<&str> {
        non_blank(self.session_id.as_deref())
    }

    pub fn device(&self) -> Option<&str> {
        non_blank(self.device_signature.as_deref())
    }

    pub fn screen_hash(&self) -> Option<String> {
        non_blank(self.screen_value.as_deref()).map(signature_hash)
    }

    pub fn gpu_hash(&self) -> Option<String> {
        non_blank(self.gpu_signature.as_deref()).map(signature_hash)
    }

    /// Whether any signal at all was supplied
    pub fn has_signals(&self) -> bool {
        self.session().is_some()
            || self.device().is_some()
            || !self.ip_candidates().is_empty()
            || self.screen_hash().is_some()
            || self.gpu_hash().is_some()
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
