//! Confidence tiers and weights
//!
//! A match's confidence is a pure function of how it was found: which signal
//! tier matched and whether it came from the direct lookup or the slower
//! index-scan fallback.

use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Session,
    Device,
    IpPrimary,
    IpConversion,
    IpFallback,
    Screen,
    Gpu,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Session => "session_id",
            Tier::Device => "device_signature",
            Tier::IpPrimary => "ip_primary",
            Tier::IpConversion => "ip_conversion",
            Tier::IpFallback => "ip_fallback",
            Tier::Screen => "screen_hash",
            Tier::Gpu => "gpu_hash",
        }
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Tier::IpPrimary | Tier::IpConversion | Tier::IpFallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupPath {
    /// Direct per-signal lookup record
    Primary,
    /// Linear scan of full IP index entries
    IndexScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributionMethod {
    pub tier: Tier,
    pub path: LookupPath,
}

impl AttributionMethod {
    pub fn primary(tier: Tier) -> Self {
        Self {
            tier,
            path: LookupPath::Primary,
        }
    }

    pub fn index_scan(tier: Tier) -> Self {
        Self {
            tier,
            path: LookupPath::IndexScan,
        }
    }

    /// Wire label, e.g. `session_id_match` or `ip_primary_match_index_scan`
    pub fn label(&self) -> String {
        match self.path {
            LookupPath::Primary => format!("{}_match", self.tier.as_str()),
            LookupPath::IndexScan => format!("{}_match_index_scan", self.tier.as_str()),
        }
    }
}

impl std::fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Point values per tier. 220 is not assigned to any tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub session: u32,
    pub device: u32,
    pub ip_primary: u32,
    pub ip_conversion: u32,
    pub ip_fallback: u32,
    pub screen: u32,
    pub gpu: u32,
    /// Subtracted from every tier on the index-scan path
    pub index_scan_discount: u32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            session: 300,
            device: 260,
            ip_primary: 280,
            ip_conversion: 260,
            ip_fallback: 240,
            screen: 200,
            gpu: 180,
            index_scan_discount: 5,
        }
    }
}

impl ConfidenceWeights {
    /// Defaults overridden by `CONFIDENCE_*` environment variables
    ///
    /// Environment variables:
    /// - `CONFIDENCE_SESSION` (default: 300)
    /// - `CONFIDENCE_DEVICE` (default: 260)
    /// - `CONFIDENCE_IP_PRIMARY` (default: 280)
    /// - `CONFIDENCE_IP_CONVERSION` (default: 260)
    /// - `CONFIDENCE_IP_FALLBACK` (default: 240)
    /// - `CONFIDENCE_SCREEN` (default: 200)
    /// - `CONFIDENCE_GPU` (default: 180)
    /// - `CONFIDENCE_INDEX_SCAN_DISCOUNT` (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |name: &str, default: u32| -> u32 {
            match env::var(name) {
                Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    log::warn!("Invalid {} '{}', defaulting to {}", name, raw, default);
                    default
                }),
                Err(_) => default,
            }
        };

        Self {
            session: read("CONFIDENCE_SESSION", defaults.session),
            device: read("CONFIDENCE_DEVICE", defaults.device),
            ip_primary: read("CONFIDENCE_IP_PRIMARY", defaults.ip_primary),
            ip_conversion: read("CONFIDENCE_IP_CONVERSION", defaults.ip_conversion),
            ip_fallback: read("CONFIDENCE_IP_FALLBACK", defaults.ip_fallback),
            screen: read("CONFIDENCE_SCREEN", defaults.screen),
            gpu: read("CONFIDENCE_GPU", defaults.gpu),
            index_scan_discount: read("CONFIDENCE_INDEX_SCAN_DISCOUNT", defaults.index_scan_discount),
        }
    }

    pub fn tier_weight(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Session => self.session,
            Tier::Device => self.device,
            Tier::IpPrimary => self.ip_primary,
            Tier::IpConversion => self.ip_conversion,
            Tier::IpFallback => self.ip_fallback,
            Tier::Screen => self.screen,
            Tier::Gpu => self.gpu,
        }
    }

    pub fn score(&self, method: AttributionMethod) -> u32 {
        let base = self.tier_weight(method.tier);
        match method.path {
            LookupPath::Primary => base,
            LookupPath::IndexScan => base.saturating_sub(self.index_scan_discount),
        }
    }
}
