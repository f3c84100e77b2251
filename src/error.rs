//! Error types for the Nakivo exporter.
//!
//! This module defines custom error types using `thiserror` for structured
//! error handling throughout the application.

use thiserror::Error;

/// Main error type for Nakivo exporter operations.
#[derive(Debug, Error)]
pub enum NakivoError {
    /// Error communicating with the Nakivo API
    #[error("Nakivo API error: {0}")]
    Api(#[from] reqwest::Error),

    /// Host unreachable or TLS handshake rejected while opening a session
    #[error("Cannot create session to {host}: {reason}")]
    Connection { host: String, reason: String },

    /// Error parsing a Nakivo API response
    #[error("Failed to parse Nakivo API response: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A `nakivo_hosts` entry is missing a required field
    #[error("Bogus host config for {host}: {reason}")]
    InvalidHost { host: String, reason: String },

    /// A remote method was called on a session that never logged in
    #[error("Session to {0} is not authenticated")]
    NotAuthenticated(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Nakivo exporter operations.
pub type Result<T> = std::result::Result<T, NakivoError>;
