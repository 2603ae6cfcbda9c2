//! Error types for Akari

use thiserror::Error;

/// Main error type for Akari
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Mux error: {0}")]
    Mux(String),

    #[error("mux pool exhausted")]
    PoolExhausted,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias for Akari
pub type Result<T> = std::result::Result<T, Error>;
