//! Error types for icyrelay
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for the relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{}", friendly_network_error(.0))]
    Http(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server answered HTTP {0}")]
    HttpStatus(u16),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Stream ended")]
    StreamEnded,

    #[error("Malformed metadata block: {0}")]
    Framing(String),

    #[error("Stream buffer is full")]
    BufferFull,

    #[error("A local client is already attached")]
    TooManyClients,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether this error is a connectivity fault handled by the reconnect policy.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RelayError::Http(_)
                | RelayError::Connection(_)
                | RelayError::HttpStatus(_)
                | RelayError::Timeout(_)
                | RelayError::StreamEnded
                | RelayError::Io(_)
        )
    }
}

/// Result type alias for icyrelay
pub type Result<T> = std::result::Result<T, RelayError>;

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    if e.is_body() {
        return "Connection lost while reading the stream".to_string();
    }
    format!("Network error: {e}")
}
