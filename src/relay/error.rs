//! Error types for the upstream relay.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors that can occur while talking to the upstream server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a code other than the one the step expects.
    #[error("SMTP error: {code} - {message}")]
    Rejected { code: u16, message: String },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The server did not complete a step in time.
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
}

/// Specialized `Result` type for upstream client operations.
pub type Result<T> = anyhow::Result<T, ClientError>;

/// Why a relay attempt failed.
///
/// These carry upstream detail for the log only; the session collapses all
/// of them into one opaque, temporary failure before anything reaches the
/// client.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to authenticate with {address}: {source}")]
    Authenticate {
        address: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to transmit message to {address}: {source}")]
    Transmit {
        address: String,
        #[source]
        source: ClientError,
    },
}
