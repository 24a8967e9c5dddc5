//! Crate-level error type.
//!
//! Every fallible operation in the library returns [`Result`]. Most callers at
//! the edges of the engine (store writes, outbound posts, sync cycles) log and
//! swallow these; only configuration loading and explicit CLI commands surface
//! them to the user.

use thiserror::Error;

/// Errors produced by livecast components.
#[derive(Debug, Error)]
pub enum LivecastError {
    /// A TCP-level connection to the chat service could not be established.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// The chat service replied with a non-2xx status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A response body could not be decoded into the expected shape.
    #[error("JSON decode error on '{field}': {detail}")]
    Json { field: String, detail: String },

    /// The key/value backend rejected a read or write.
    #[error("storage backend error: {0}")]
    Storage(String),

    /// The configuration file is unreadable or fails validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A chat submission with no visible text.
    #[error("message body is empty")]
    EmptyMessage,

    /// The session has been unmounted; the operation was not performed.
    #[error("session is no longer active")]
    Inactive,
}

impl From<rusqlite::Error> for LivecastError {
    fn from(e: rusqlite::Error) -> Self {
        LivecastError::Storage(e.to_string())
    }
}

impl From<toml::de::Error> for LivecastError {
    fn from(e: toml::de::Error) -> Self {
        LivecastError::Config(e.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, LivecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_display_contains_status_and_url() {
        let err = LivecastError::Http {
            status: 503,
            url: "http://localhost:8080/api/chat".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("503"), "status in display: {s}");
        assert!(s.contains("/api/chat"), "url in display: {s}");
    }

    #[test]
    fn connect_display_contains_detail() {
        let err = LivecastError::Connect {
            url: "http://localhost:1".to_string(),
            detail: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn toml_error_maps_to_config() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("not = [valid");
        let err: LivecastError = parse.unwrap_err().into();
        assert!(matches!(err, LivecastError::Config(_)));
    }

    #[test]
    fn is_std_error() {
        fn assert_error<E: std::error::Error>(_: &E) {}
        assert_error(&LivecastError::EmptyMessage);
    }
}
