use thiserror::Error;

use crate::signal::DecodeError;

/// Errors that can occur while running the relay.
///
/// Every variant is fatal for the process; components return them instead of
/// aborting so the binary's top-level boundary decides how to exit.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or invalid environment configuration
    #[error("configuration: {0}")]
    Config(String),
    /// The credential issuer rejected the request or returned garbage
    #[error("credential fetch failed: {0}")]
    CredentialFetch(String),
    /// SDP negotiation with the transport failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The pasted offer token could not be decoded
    #[error("offer token rejected: {0}")]
    Decode(#[from] DecodeError),
    /// RTP read or write failure on the media pipeline
    #[error("relay i/o: {0}")]
    RelayIo(String),
}
