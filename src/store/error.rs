//! Store error taxonomy
//!
//! Only `Unauthorized` is fatal to an invocation. Everything else is treated as
//! a transient failure of the current chunk and retried by the next invocation.

#[derive(Debug)]
pub enum StoreError {
    /// Network-level failure (connect, timeout, TLS)
    Transport(String),
    /// Store reachable but refusing work (5xx, rate limited)
    Unavailable(String),
    /// Bad or missing credentials
    Unauthorized(String),
    /// Store answered with something we could not interpret
    Protocol(String),
    Serialization(serde_json::Error),
    Database(String),
}

impl StoreError {
    /// Whether the error must abort the whole invocation
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Transport(_) => "transport",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Unauthorized(_) => "unauthorized",
            StoreError::Protocol(_) => "protocol",
            StoreError::Serialization(_) => "serialization",
            StoreError::Database(_) => "database",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return StoreError::Unauthorized(err.to_string());
            }
            if status.is_server_error() || status.as_u16() == 429 {
                return StoreError::Unavailable(err.to_string());
            }
        }
        if err.is_decode() {
            return StoreError::Protocol(err.to_string());
        }
        StoreError::Transport(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transport(e) => write!(f, "Store transport error: {}", e),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {}", e),
            StoreError::Unauthorized(e) => write!(f, "Store rejected credentials: {}", e),
            StoreError::Protocol(e) => write!(f, "Unexpected store response: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}
