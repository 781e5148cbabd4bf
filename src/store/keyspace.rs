//! Typed keyspace registry
//!
//! Every key this crate reads or writes is built here, and every key found
//! during a scan is classified here. Key names embed raw facet values, so the
//! encoding rule below is part of the wire contract shared with other writers.
//!
//! | Kind        | Layout                          |
//! |-------------|---------------------------------|
//! | Pageview    | `pageview:<id>` / `pv:<id>`     |
//! | Conversion  | `purchase:<id>` / `conversion:` |
//! | Index       | `idx:v1:<facet>:<encoded>`      |
//! | Lookup      | `lk:v1:<facet>:<encoded>`       |
//! | Progress    | `progress:<job>`                |
//! | Cache       | `cache:<kind>:<id>`             |

use serde::{Deserialize, Serialize};

/// Longest encoded facet component. Longer values are truncated, which can
/// make two distinct long values (typically landing-page URLs) share a key.
pub const MAX_COMPONENT_LEN: usize = 120;

/// Schema tag embedded in index and lookup keys
pub const INDEX_KEY_VERSION: &str = "v1";

const PAGEVIEW_PREFIXES: &[&str] = &["pageview:", "pv:"];
const CONVERSION_PREFIXES: &[&str] = &["purchase:", "conversion:"];
const INDEX_PREFIX: &str = "idx:";
const LOOKUP_PREFIX: &str = "lk:";
const PROGRESS_PREFIX: &str = "progress:";
const CACHE_PREFIX: &str = "cache:";

/// Dimension an event can be indexed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Ip,
    Session,
    LandingPage,
    Source,
    Date,
    Email,
    Device,
    Screen,
    Gpu,
}

impl Facet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facet::Ip => "ip",
            Facet::Session => "session",
            Facet::LandingPage => "landing",
            Facet::Source => "source",
            Facet::Date => "date",
            Facet::Email => "email",
            Facet::Device => "device",
            Facet::Screen => "screen",
            Facet::Gpu => "gpu",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Facet::all().into_iter().find(|f| f.as_str() == s)
    }

    pub fn all() -> [Facet; 9] {
        [
            Facet::Ip,
            Facet::Session,
            Facet::LandingPage,
            Facet::Source,
            Facet::Date,
            Facet::Email,
            Facet::Device,
            Facet::Screen,
            Facet::Gpu,
        ]
    }

    /// Facets that identify a visitor and get a direct lookup record
    pub fn is_identity_signal(&self) -> bool {
        matches!(
            self,
            Facet::Ip | Facet::Session | Facet::Device | Facet::Screen | Facet::Gpu
        )
    }
}

impl std::fmt::Display for Facet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Pageview,
    Conversion,
    Index(Option<Facet>),
    Lookup(Option<Facet>),
    Progress,
    Cache,
    Unknown,
}

impl KeyKind {
    /// Classify a key by its registered prefix
    pub fn classify(key: &str) -> Self {
        if PAGEVIEW_PREFIXES.iter().any(|p| key.starts_with(p)) {
            return KeyKind::Pageview;
        }
        if CONVERSION_PREFIXES.iter().any(|p| key.starts_with(p)) {
            return KeyKind::Conversion;
        }
        if let Some(rest) = key.strip_prefix(INDEX_PREFIX) {
            return KeyKind::Index(facet_segment(rest));
        }
        if let Some(rest) = key.strip_prefix(LOOKUP_PREFIX) {
            return KeyKind::Lookup(facet_segment(rest));
        }
        if key.starts_with(PROGRESS_PREFIX) {
            return KeyKind::Progress;
        }
        if key.starts_with(CACHE_PREFIX) {
            return KeyKind::Cache;
        }
        KeyKind::Unknown
    }

    /// Whether the scanner should try to read this key as a touchpoint.
    /// Unregistered keys are attempted since legacy writers used other prefixes.
    pub fn is_scan_candidate(&self) -> bool {
        matches!(self, KeyKind::Pageview | KeyKind::Unknown)
    }
}

fn facet_segment(rest: &str) -> Option<Facet> {
    let mut parts = rest.splitn(3, ':');
    let _version = parts.next()?;
    Facet::from_str(parts.next()?)
}

/// Encode a raw facet value into the safe key alphabet `[A-Za-z0-9_-]`
///
/// Percent-encodes, maps every remaining character outside the alphabet to
/// `_`, then truncates to [`MAX_COMPONENT_LEN`]. Deterministic; not injective
/// (`a.b` and `a_b` collide, as do long values sharing a prefix).
pub fn encode_component(raw: &str) -> String {
    let encoded = urlencoding::encode(raw.trim());
    encoded
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COMPONENT_LEN)
        .collect()
}

pub fn index_key(facet: Facet, value: &str) -> String {
    format!(
        "{}{}:{}:{}",
        INDEX_PREFIX,
        INDEX_KEY_VERSION,
        facet.as_str(),
        encode_component(value)
    )
}

pub fn lookup_key(facet: Facet, value: &str) -> String {
    format!(
        "{}{}:{}:{}",
        LOOKUP_PREFIX,
        INDEX_KEY_VERSION,
        facet.as_str(),
        encode_component(value)
    )
}

/// Prefix shared by every lookup key of one facet, for `SCAN MATCH` patterns
pub fn lookup_prefix(facet: Facet) -> String {
    format!("{}{}:{}:", LOOKUP_PREFIX, INDEX_KEY_VERSION, facet.as_str())
}

pub fn progress_key(job_name: &str) -> String {
    format!("{}{}", PROGRESS_PREFIX, encode_component(job_name))
}

pub fn journey_cache_key(conversion_id: &str) -> String {
    format!("{}journey:{}", CACHE_PREFIX, encode_component(conversion_id))
}
